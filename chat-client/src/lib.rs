//! # chatsync-client
//!
//! Real-time messaging engine for chat applications.
//!
//! Keeps one logical session with a chat server over a pub/sub transport
//! and hides the unreliable network from the application.
//!
//! ## Features
//!
//! - **Bounded Reconnection**: exponential backoff with jitter and an attempt cap
//! - **Durable Subscriptions**: registrations survive reconnects and are replayed
//! - **Request/Reply**: responses routed back to the request that caused them
//! - **Deduplication**: every message is delivered to the application once
//! - **Optimistic Sends**: local entries reconciled with server confirmations
//! - **Polling Fallback**: out-of-band history fetch while offline
//! - **Transport Abstraction**: pluggable transport layer (mock included)
//! - **Pure State Machine**: uses chat-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use chat_client::{ChatClient, ChatEvent, ClientConfig, EventKind, MemoryCredentials, MockTransport};
//! use chat_types::UserId;
//!
//! let client = ChatClient::new(
//!     ClientConfig::default(),
//!     MockTransport::new(),
//!     MemoryCredentials::new("token", UserId::new(1)),
//! )?;
//!
//! client.on(EventKind::NewMessage, |event| println!("{:?}", event));
//! client.connect().await?;
//! client.send_message(UserId::new(7), "hello").await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod correlator;
pub mod credentials;
pub mod error;
pub mod events;
pub mod fallback;
pub mod transport;

pub use client::{ChatClient, SendOutcome};
pub use config::{
    ClientConfig, ConfigError, ConnectionConfig, DedupConfig, FallbackConfig, ReconcileConfig,
    ReconnectConfig, RequestConfig,
};
pub use correlator::CORRELATION_FIELD;
pub use credentials::{Credential, CredentialStore, MemoryCredentials};
pub use error::{ClientError, ErrorKind};
pub use events::{ChatEvent, EventBus, EventKind, ListenerId};
pub use fallback::{spawn_fallback_poller, HistorySource};
pub use transport::{ConnectOptions, MockTransport, Transport, TransportError, TransportEvent};
