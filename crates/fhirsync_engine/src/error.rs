//! Error types for the sync engine.

use fhirsync_protocol::{ProtocolError, RecordKey};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Per-record and per-type errors are collected into the
/// [`SyncCycleResult`](crate::SyncCycleResult) of a pass. Only
/// [`SyncError::is_fatal`] errors abort a pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether a later pass may succeed.
        retryable: bool,
    },

    /// Malformed payload from the server.
    #[error("decode error: {0}")]
    Decode(String),

    /// A request could not be built.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A record conflicted a second time within one pass.
    #[error("conflict retry exhausted for {key}")]
    ConflictExhausted {
        /// The record that kept conflicting.
        key: RecordKey,
    },

    /// Another pass holds the sync lease.
    #[error("sync already in progress (lease held by {holder} until {expires_at_ms})")]
    LeaseUnavailable {
        /// Current lease holder.
        holder: String,
        /// When the current lease expires, in Unix milliseconds.
        expires_at_ms: u64,
    },

    /// The server refused a write for domain reasons.
    #[error("write of {key} rejected: {reason}")]
    RejectedWrite {
        /// The refused record.
        key: RecordKey,
        /// Reason given by the server.
        reason: String,
    },

    /// The local store failed.
    #[error("local store error: {0}")]
    Store(String),

    /// Watermark persistence failed.
    #[error("token store error: {0}")]
    TokenStore(String),

    /// The lease backend failed.
    #[error("lease error: {0}")]
    Lease(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a local store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Returns true if a later pass may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::LeaseUnavailable { .. } => true,
            SyncError::ConflictExhausted { .. } => true,
            SyncError::Cancelled => true,
            _ => false,
        }
    }

    /// Returns true if this error aborts the whole pass.
    ///
    /// Everything else is recorded per record or per resource type.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Store(_)
                | SyncError::TokenStore(_)
                | SyncError::Lease(_)
                | SyncError::LeaseUnavailable { .. }
        )
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Encode(message) => SyncError::Protocol(message),
            other => SyncError::Decode(other.to_string()),
        }
    }
}
