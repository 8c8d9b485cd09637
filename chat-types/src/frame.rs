//! Inbound frames and JSON body helpers.
//!
//! The transport hands the engine `(destination, body)` pairs. Bodies are JSON
//! text; decoding into a concrete payload happens only where the receiver
//! knows which shape to expect.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

use crate::WireError;

/// A message received on a named destination.
#[derive(Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Destination the message was published to
    pub destination: String,
    /// JSON text body
    pub body: String,
}

impl InboundFrame {
    /// Create a new frame.
    pub fn new(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            body: body.into(),
        }
    }

    /// Decode the body into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        decode_body(&self.destination, &self.body)
    }

    /// Decode the body as an untyped JSON value.
    pub fn json(&self) -> Result<serde_json::Value, WireError> {
        self.decode()
    }
}

// Bodies can carry message text; keep them out of logs.
impl fmt::Debug for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundFrame")
            .field("destination", &self.destination)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Serialize a payload into a JSON body.
pub fn encode_body<T: Serialize + ?Sized>(payload: &T) -> Result<String, WireError> {
    serde_json::to_string(payload).map_err(WireError::Serialization)
}

/// Deserialize a JSON body received on `destination`.
pub fn decode_body<T: DeserializeOwned>(destination: &str, body: &str) -> Result<T, WireError> {
    serde_json::from_str(body).map_err(|source| WireError::Deserialization {
        destination: destination.to_string(),
        source,
    })
}
