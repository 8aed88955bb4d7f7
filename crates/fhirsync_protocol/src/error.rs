//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serializing a message to CBOR failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// The bytes were not valid CBOR for the expected message.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message had the right shape but violated a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Unknown message type code.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
}

impl ProtocolError {
    /// Creates an invalid message error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::UnknownMessageType(42);
        assert_eq!(err.to_string(), "unknown message type: 42");

        let err = ProtocolError::invalid("empty record id");
        assert!(err.to_string().contains("empty record id"));
    }
}
