//! Error types for chatsync payloads.

use thiserror::Error;

/// Errors that can occur while encoding or decoding payload bodies.
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed on {destination}: {source}")]
    Deserialization {
        /// Destination the body arrived on (empty when unknown)
        destination: String,
        /// Underlying parse error
        #[source]
        source: serde_json::Error,
    },

    /// Structurally valid JSON with unusable content
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WireError::InvalidData("empty content".into());
        assert_eq!(err.to_string(), "invalid data: empty content");
    }

    #[test]
    fn deserialization_error_names_destination() {
        let source = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = WireError::Deserialization {
            destination: "/user/queue/messages".into(),
            source,
        };
        assert!(err.to_string().contains("/user/queue/messages"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WireError>();
    }
}
