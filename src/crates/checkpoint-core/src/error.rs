//! Error types for checkpoint operations
//!
//! Four-way taxonomy: `Validation` failures are raised before any I/O and
//! never retried; `NotFound` is terminal and surfaced as-is; `Storage`
//! wraps backend I/O failures with operation context and a `retryable` tag
//! (pool exhaustion is explicitly retryable); `Connection` marks operations
//! attempted against a disconnected backend.

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Invalid input or an operation the lifecycle rules forbid
    #[error("Validation error: {0}")]
    Validation(String),

    /// Checkpoint, backup or thread does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend I/O failure; callers may retry when `retryable` is set
    #[error("Storage error during {operation}: {message}")]
    Storage {
        operation: String,
        message: String,
        retryable: bool,
    },

    /// Operation attempted on a disconnected backend
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),
}

impl CheckpointError {
    /// Non-retryable storage error with operation context
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CheckpointError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Retryable storage error (pool exhaustion, transient I/O)
    pub fn storage_retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CheckpointError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CheckpointError::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CheckpointError::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckpointError::Storage { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_flag() {
        let err = CheckpointError::storage_retryable("put", "pool timed out");
        assert!(err.is_retryable());

        let err = CheckpointError::storage("put", "disk full");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_found_helper() {
        let err = CheckpointError::not_found("checkpoint cp1");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_error_carries_operation() {
        let err = CheckpointError::storage("list", "bad page");
        assert!(format!("{err}").contains("list"));
    }
}
