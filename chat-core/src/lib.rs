//! # chat-core
//!
//! Pure synchronization logic for chatsync (no I/O, instant tests).
//!
//! This crate implements the state machines and bookkeeping behind the
//! messaging engine without any network access, timers or logging.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is always passed in as an [`std::time::Instant`]
//! and randomness (backoff jitter) is sampled separately from the arithmetic
//! that consumes it. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (transport, timers, tasks) is performed by `chat-client`,
//! which interprets the actions and decisions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod correlation;
pub mod fingerprint;
pub mod reconcile;
pub mod reconnect;
pub mod state;
pub mod subscriptions;

pub use backoff::BackoffPolicy;
pub use correlation::{PendingEntry, PendingRequests, RequestId};
pub use fingerprint::{Fingerprint, FingerprintStore, DEFAULT_OUTBOUND_WINDOW, DEFAULT_PROCESSED_CAPACITY};
pub use reconcile::{PendingMessage, PendingStatus, ReconcilePolicy, Reconciliation, Reconciler};
pub use reconnect::{ReconnectPhase, ReconnectScheduler, ReconnectionAttempt, Schedule};
pub use state::{Action, ConnectionState, Event, Session, SessionEpoch, StatusChange};
pub use subscriptions::{Activation, Completion, SubscriptionRegistry, Unregistered};
