//! Error types for the chatsync engine.

use std::time::Duration;
use thiserror::Error;

use chat_types::{LocalId, WireError};

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Stable classification of engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Handshake, auth or transport connection failure.
    Connection,
    /// A request or bounded operation exceeded its deadline.
    Timeout,
    /// Publish or subscribe attempted while disconnected.
    TransportUnavailable,
    /// An operation was intentionally discarded as a duplicate.
    DuplicateSuppressed,
    /// A response payload failed to parse.
    MalformedResponse,
    /// Reconnection gave up after the attempt cap.
    ExhaustedRetries,
    /// Error notice pushed by the server.
    Server,
    /// Invalid argument or configuration supplied by the caller.
    InvalidInput,
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection or handshake failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// No response within the deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Not connected.
    #[error("transport unavailable: not connected")]
    TransportUnavailable,

    /// Operation discarded as a duplicate.
    #[error("duplicate suppressed")]
    DuplicateSuppressed,

    /// Response body could not be parsed into the expected shape.
    #[error("malformed response on {destination}: {reason}")]
    MalformedResponse {
        /// Destination the response arrived on.
        destination: String,
        /// Parse failure.
        reason: String,
    },

    /// Reconnection attempts are exhausted.
    #[error("reconnection gave up after {attempts} attempts")]
    ExhaustedRetries {
        /// Attempts made.
        attempts: u32,
    },

    /// The connection dropped while the operation was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The credential store has no token or user id.
    #[error("no credential available")]
    MissingCredential,

    /// No optimistic message with this id can be retried.
    #[error("no failed message with local id {0}")]
    UnknownMessage(LocalId),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload encoding or decoding error.
    #[error("payload error: {0}")]
    Wire(#[from] WireError),
}

impl ClientError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connection(_)
            | ClientError::ConnectionLost(_)
            | ClientError::MissingCredential => ErrorKind::Connection,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::TransportUnavailable => ErrorKind::TransportUnavailable,
            ClientError::DuplicateSuppressed => ErrorKind::DuplicateSuppressed,
            ClientError::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            ClientError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            ClientError::UnknownMessage(_) | ClientError::Config(_) => ErrorKind::InvalidInput,
            ClientError::Transport(e) => match e {
                TransportError::NotConnected | TransportError::ConnectionClosed => {
                    ErrorKind::TransportUnavailable
                }
                TransportError::Timeout => ErrorKind::Timeout,
                _ => ErrorKind::Connection,
            },
            ClientError::Wire(WireError::Deserialization { .. }) => ErrorKind::MalformedResponse,
            ClientError::Wire(_) => ErrorKind::InvalidInput,
        }
    }

    /// Map a publish failure, folding "not connected" into [`ClientError::TransportUnavailable`].
    pub(crate) fn from_publish(error: TransportError) -> Self {
        match error {
            TransportError::NotConnected | TransportError::ConnectionClosed => {
                ClientError::TransportUnavailable
            }
            other => ClientError::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_error_taxonomy() {
        assert_eq!(
            ClientError::Timeout(Duration::from_secs(20)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            ClientError::ConnectionLost("closed".into()).kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            ClientError::ExhaustedRetries { attempts: 10 }.kind(),
            ErrorKind::ExhaustedRetries
        );
        assert_eq!(
            ClientError::Transport(TransportError::NotConnected).kind(),
            ErrorKind::TransportUnavailable
        );
        assert_eq!(
            ClientError::Transport(TransportError::Rejected("bad token".into())).kind(),
            ErrorKind::Connection
        );
    }

    #[test]
    fn publish_not_connected_is_transport_unavailable() {
        assert!(matches!(
            ClientError::from_publish(TransportError::NotConnected),
            ClientError::TransportUnavailable
        ));
        assert!(matches!(
            ClientError::from_publish(TransportError::SendFailed("x".into())),
            ClientError::Transport(_)
        ));
    }

    #[test]
    fn error_display() {
        let err = ClientError::MalformedResponse {
            destination: "/user/queue/history".into(),
            reason: "expected value".into(),
        };
        assert_eq!(
            err.to_string(),
            "malformed response on /user/queue/history: expected value"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClientError>();
    }
}
