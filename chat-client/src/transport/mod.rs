//! Transport abstraction for chatsync.
//!
//! The engine assumes a named-destination publish/subscribe transport with
//! at-least-once delivery and no request correlation (a STOMP-over-WebSocket
//! broker, for example). Framing and handshake bytes belong to the
//! implementation, not to the engine.
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` establishes a connection and returns its event stream
//! - `subscribe()` / `unsubscribe()` manage live subscriptions on it
//! - `publish()` sends a JSON body to a destination
//! - `heartbeat()` checks liveness; the answer arrives on the event stream
//! - `close()` terminates it
//!
//! Each successful `connect()` returns a fresh receiver. The receiver ending,
//! or yielding [`TransportEvent::Closed`], means that connection is gone.

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use chat_types::{InboundFrame, TransportHandle};

use crate::credentials::Credential;

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server refused the credential during the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Publish failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Subscribe failed.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Something that happened on a live connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message arrived on a subscribed destination.
    Frame(InboundFrame),
    /// The server answered a heartbeat.
    Heartbeat,
    /// The connection was closed by the peer or failed.
    Closed {
        /// Reason for the close.
        reason: String,
    },
}

/// Parameters for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Server endpoint.
    pub endpoint: String,
    /// Auth credential presented during the handshake.
    pub credential: Credential,
    /// Heartbeat interval negotiated with the server.
    pub heartbeat: Duration,
}

/// Publish/subscribe transport used by the engine.
///
/// Implementations handle the underlying connection mechanism
/// (STOMP over WebSocket, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect and authenticate. Returns the event stream of this connection.
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    /// Publish a JSON body to a destination.
    async fn publish(&self, destination: &str, body: &str) -> Result<(), TransportError>;

    /// Subscribe to a destination on the current connection.
    async fn subscribe(&self, destination: &str) -> Result<TransportHandle, TransportError>;

    /// Drop a live subscription.
    async fn unsubscribe(&self, handle: TransportHandle) -> Result<(), TransportError>;

    /// Send a heartbeat; the server answers with [`TransportEvent::Heartbeat`].
    async fn heartbeat(&self) -> Result<(), TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}
