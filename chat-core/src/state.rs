//! Connection state machine for chatsync.
//!
//! This module provides a pure, side-effect-free state machine for managing
//! the lifecycle of the single logical session. The state machine takes
//! events as input and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (opening the transport, replaying subscriptions, arming
//! reconnect timers) is performed by chat-client, not by this module.

use std::fmt;

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session and none wanted.
    #[default]
    Disconnected,
    /// Transport connection and auth handshake in progress.
    Connecting,
    /// Session established.
    Connected,
    /// Session lost, waiting for a scheduled retry.
    Reconnecting,
    /// Retries exhausted; terminal until an explicit connect or reset.
    Failed,
}

impl ConnectionState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (chat-client)
    /// is responsible for executing the returned actions in order.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // Explicit connect
            (Self::Disconnected, Event::ConnectRequested) => {
                (Self::Connecting, vec![Action::OpenTransport])
            }
            (Self::Failed, Event::ConnectRequested) => (
                Self::Connecting,
                vec![Action::ResetAttempts, Action::OpenTransport],
            ),
            (Self::Reconnecting, Event::ConnectRequested) => (
                Self::Connecting,
                vec![Action::CancelReconnection, Action::OpenTransport],
            ),

            // From Connecting
            (Self::Connecting, Event::ConnectSucceeded) => (
                Self::Connected,
                vec![Action::ResetAttempts, Action::ResubscribeAll],
            ),
            (
                Self::Connecting,
                Event::ConnectFailed {
                    retries_left: true, ..
                },
            ) => (
                Self::Reconnecting,
                vec![Action::CloseTransport, Action::StartReconnection],
            ),
            (
                Self::Connecting,
                Event::ConnectFailed {
                    retries_left: false,
                    ..
                },
            ) => (
                Self::Failed,
                vec![Action::CloseTransport, Action::ReportExhausted],
            ),

            // From Connected
            (Self::Connected, Event::TransportLost { reason }) => (
                Self::Reconnecting,
                vec![
                    Action::DeactivateSubscriptions,
                    Action::RejectPendingRequests { reason },
                    Action::CloseTransport,
                    Action::StartReconnection,
                ],
            ),

            // From Reconnecting
            (Self::Reconnecting, Event::RetryTimerFired) => {
                (Self::Connecting, vec![Action::OpenTransport])
            }
            (Self::Reconnecting, Event::RetriesExhausted) => {
                (Self::Failed, vec![Action::ReportExhausted])
            }

            // From Failed
            (Self::Failed, Event::ResetRequested) => (
                Self::Reconnecting,
                vec![Action::ResetAttempts, Action::StartReconnection],
            ),

            // Disconnect is valid from anywhere except Disconnected
            (state, Event::DisconnectRequested) if state != Self::Disconnected => (
                Self::Disconnected,
                vec![
                    Action::CancelReconnection,
                    Action::DeactivateSubscriptions,
                    Action::RejectPendingRequests {
                        reason: "disconnected".into(),
                    },
                    Action::CloseTransport,
                ],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if currently trying to connect.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Lowercase name used in logs and status events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Application (or a forced reconnect) asked for a connection.
    ConnectRequested,
    /// Transport connected and the auth handshake succeeded.
    ConnectSucceeded,
    /// Transport connection or handshake failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
        /// Whether the reconnection scheduler may still retry.
        retries_left: bool,
    },
    /// Established transport was lost (closed, errored or heartbeat timeout).
    TransportLost {
        /// Reason for the loss.
        reason: String,
    },
    /// A scheduled reconnection attempt is due.
    RetryTimerFired,
    /// The scheduler refused to schedule another attempt.
    RetriesExhausted,
    /// Explicit reset of the attempt counter.
    ResetRequested,
    /// Application requested disconnect.
    DisconnectRequested,
}

impl Event {
    /// Human-readable detail carried by the event, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Event::ConnectFailed { error, .. } => Some(error),
            Event::TransportLost { reason } => Some(reason),
            Event::RetriesExhausted => Some("retries exhausted"),
            _ => None,
        }
    }
}

/// Actions to be executed by chat-client.
///
/// These are instructions, not side effects. chat-client interprets
/// these and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport and perform the auth handshake.
    OpenTransport,
    /// Tear down the transport.
    CloseTransport,
    /// Replay every registered subscription on the new connection.
    ResubscribeAll,
    /// Forget live transport subscriptions, keeping registrations.
    DeactivateSubscriptions,
    /// Reject every in-flight request.
    RejectPendingRequests {
        /// Rejection reason.
        reason: String,
    },
    /// Ask the reconnection scheduler for the next attempt.
    StartReconnection,
    /// Cancel any scheduled reconnection attempt.
    CancelReconnection,
    /// Zero the reconnection attempt counter.
    ResetAttempts,
    /// Surface retry exhaustion to the application.
    ReportExhausted,
    /// Notify the application of a state change.
    EmitStatus(StatusChange),
}

/// Monotonic counter of established connections.
///
/// Work scheduled under an older epoch (timers, pumps, activations) is stale
/// once the epoch advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessionEpoch(u64);

impl SessionEpoch {
    /// Create an epoch from its numeric value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The following epoch.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SessionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A completed state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Previous state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
    /// Epoch after the transition.
    pub epoch: SessionEpoch,
    /// Error or reason attached to the triggering event.
    pub detail: Option<String>,
}

/// The single logical session: state plus epoch.
#[derive(Debug, Clone, Default)]
pub struct Session {
    state: ConnectionState,
    epoch: SessionEpoch,
}

impl Session {
    /// Create a disconnected session at epoch 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current epoch.
    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    /// Apply an event to the session.
    ///
    /// Entering `Connected` advances the epoch. Every actual state change
    /// appends an [`Action::EmitStatus`] after the state machine's actions.
    pub fn apply(&mut self, event: Event) -> Vec<Action> {
        let detail = event.detail().map(str::to_string);
        let from = self.state;
        let (to, mut actions) = from.on_event(event);

        if to == from {
            return actions;
        }

        if to == ConnectionState::Connected {
            self.epoch = self.epoch.next();
        }
        self.state = to;

        actions.push(Action::EmitStatus(StatusChange {
            from,
            to,
            epoch: self.epoch,
            detail,
        }));
        actions
    }
}
