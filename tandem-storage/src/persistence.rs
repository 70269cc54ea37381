//! The persistence port and the records that cross it.

use crate::error::StorageResult;
use crate::wal::WalEntry;
use serde::{Deserialize, Serialize};
use tandem_types::{EntityId, Operation, VectorClock};

/// Last-known-good state of one projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_id: EntityId,
    pub entity_type: String,
    /// Serialized projection (document or entity).
    pub state: serde_json::Value,
    /// Highest local WAL offset whose effect the state contains.
    pub covered_offset: u64,
}

/// Sync progress, committed together with the snapshots it describes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Opaque position in the remote's operation stream.
    pub remote_cursor: u64,
    /// Local clock at commit time.
    pub clock: VectorClock,
    /// Pulled operations waiting for causal dependencies.
    #[serde(default)]
    pub deferred: Vec<Operation>,
}

/// Everything [`Persistence::load`] returns.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub snapshots: Vec<Snapshot>,
    pub checkpoint: Checkpoint,
    /// Surviving log entries in append order.
    pub wal: Vec<WalEntry>,
    /// Highest offset ever appended, including compacted entries.
    pub last_offset: u64,
}

/// Durable local storage consumed by the core.
///
/// `append_wal` must be crash-durable when it returns `Ok`. `commit` must be
/// atomic: either every snapshot and the checkpoint are stored, or none.
pub trait Persistence: Send + Sync {
    fn load(&self) -> StorageResult<PersistedState>;

    fn append_wal(&self, entry: &WalEntry) -> StorageResult<()>;

    /// Replaces the stored entry with the same offset.
    fn update_wal(&self, entry: &WalEntry) -> StorageResult<()>;

    fn remove_wal(&self, offsets: &[u64]) -> StorageResult<()>;

    /// Upserts snapshots and replaces the checkpoint in one transaction.
    fn commit(&self, snapshots: &[Snapshot], checkpoint: &Checkpoint) -> StorageResult<()>;
}
