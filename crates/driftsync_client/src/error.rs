//! Error types for the sync client.

use driftsync_protocol::FrameError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The application-supplied upload function failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// `complete` was called on a queued transaction that is not the head.
    #[error("out-of-order completion: head is transaction {expected}, got {got}")]
    OutOfOrderCompletion {
        /// Id of the current head transaction.
        expected: u64,
        /// Id the caller tried to complete.
        got: u64,
    },

    /// `complete` was called with an id that is not in the queue.
    #[error("transaction {0} not found in the CRUD queue")]
    TransactionNotFound(u64),

    /// Operation is invalid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The stream carried an undecodable frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The stream or session was closed.
    #[error("stream closed")]
    Closed,
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

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Upload(_) => true,
            SyncError::Closed => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Upload("server 500".into()).is_retryable());
        assert!(SyncError::Closed.is_retryable());
        assert!(!SyncError::TransactionNotFound(3).is_retryable());
        assert!(!SyncError::InvalidState("mid-disconnect".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::OutOfOrderCompletion {
            expected: 1,
            got: 4,
        };
        assert!(err.to_string().contains('1'));
        assert!(err.to_string().contains('4'));

        let err = SyncError::TransactionNotFound(9);
        assert_eq!(err.to_string(), "transaction 9 not found in the CRUD queue");
    }
}
