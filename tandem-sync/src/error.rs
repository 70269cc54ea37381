//! Error types for the sync layer.

use tandem_crdt::CrdtError;
use tandem_storage::StorageError;
use tandem_types::EntityId;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The log or a commit did not reach durable storage. Fatal to the
    /// triggering call and never retried.
    #[error("durability failure: {0}")]
    Durability(#[from] StorageError),

    /// Transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// A transport call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The coordinator is offline.
    #[error("offline")]
    Offline,

    /// Optimistic-lock rejection: re-read the field and retry.
    #[error("version conflict on {entity_id}/{field}: expected version {expected}, found {actual}")]
    VersionConflict {
        entity_id: EntityId,
        field: String,
        expected: u64,
        actual: u64,
    },

    /// No schema declares this entity type.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// The operation does not fit the declared strategy.
    #[error("{entity_type} is declared {strategy}; {operation} is not supported")]
    StrategyMismatch {
        entity_type: String,
        strategy: &'static str,
        operation: &'static str,
    },

    /// An entity ID is already used by another entity type.
    #[error("entity {entity_id} is a {existing}, not a {requested}")]
    TypeMismatch {
        entity_id: EntityId,
        existing: String,
        requested: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// CRDT error.
    #[error("crdt error: {0}")]
    Crdt(#[from] CrdtError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] tandem_types::Error),

    /// A lock was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl SyncError {
    /// Transport-type failures: recoverable by backing off and retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::Offline)
    }
}

pub(crate) fn lock<'a, T>(
    mutex: &'a std::sync::Mutex<T>,
    what: &'static str,
) -> SyncResult<std::sync::MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| SyncError::LockPoisoned(what))
}
