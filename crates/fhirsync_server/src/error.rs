//! Error types for the sync server.

use fhirsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request content.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No handler for the requested path.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// The continuation cursor could not be parsed.
    #[error("invalid cursor: {0:?}")]
    InvalidCursor(String),

    /// A filter the server does not support.
    #[error("unsupported filter: {0}")]
    UnsupportedFilter(String),

    /// Batch larger than the configured cap.
    #[error("batch too large: {size} > {max}")]
    BatchTooLarge {
        /// Writes in the request.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// The request body could not be decoded or the response encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::UnknownEndpoint(_)
                | ServerError::InvalidCursor(_)
                | ServerError::UnsupportedFilter(_)
                | ServerError::BatchTooLarge { .. }
                | ServerError::Protocol(ProtocolError::Decode(_))
                | ServerError::Protocol(ProtocolError::InvalidMessage(_))
                | ServerError::Protocol(ProtocolError::UnknownMessageType(_))
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::UnknownEndpoint(_) => 404,
            ServerError::BatchTooLarge { .. } => 413,
            _ if self.is_client_error() => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert!(ServerError::Protocol(ProtocolError::Decode("eof".into())).is_client_error());
        assert!(ServerError::Protocol(ProtocolError::Encode("io".into())).is_server_error());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ServerError::UnknownEndpoint("/x".into()).status_code(), 404);
        assert_eq!(
            ServerError::BatchTooLarge { size: 7, max: 5 }.status_code(),
            413
        );
        assert_eq!(ServerError::InvalidCursor("zz".into()).status_code(), 400);
        assert_eq!(ServerError::Internal("oops".into()).status_code(), 500);
    }

    #[test]
    fn error_display() {
        let msg = ServerError::BatchTooLarge { size: 7, max: 5 }.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains('5'));
    }
}
