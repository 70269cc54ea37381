//! Error types for the storage layer.

use crate::wal::EntryStatus;
use tandem_types::OperationId;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A write did not reach durable storage.
    #[error("durability failure: {0}")]
    Durability(String),

    /// No log entry with this operation ID.
    #[error("log entry not found: {0}")]
    EntryNotFound(OperationId),

    /// A status transition found the entry in an unexpected state.
    #[error("cannot move {id} out of {actual:?}; expected {expected:?}")]
    StaleTransition {
        id: OperationId,
        expected: EntryStatus,
        actual: EntryStatus,
    },

    /// Stored data could not be interpreted.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl StorageError {
    pub(crate) fn poisoned() -> Self {
        Self::Durability("storage lock poisoned".into())
    }
}
