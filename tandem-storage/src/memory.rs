//! In-memory persistence for tests.
//!
//! Clones share state, so dropping every in-process structure and reopening
//! from a clone simulates a crash: only what the port accepted survives.

use crate::error::{StorageError, StorageResult};
use crate::persistence::{Checkpoint, PersistedState, Persistence, Snapshot};
use crate::wal::WalEntry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_types::EntityId;

#[derive(Debug, Default)]
struct MemoryState {
    wal: BTreeMap<u64, WalEntry>,
    snapshots: BTreeMap<EntityId, Snapshot>,
    checkpoint: Checkpoint,
    last_offset: u64,
    fail_appends: bool,
    fail_commits: bool,
    commits: usize,
}

/// A [`Persistence`] implementation that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| StorageError::poisoned())
    }

    /// Makes every subsequent `append_wal` fail until reset.
    pub fn fail_appends(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_appends = fail;
        }
    }

    /// Makes every subsequent `commit` fail until reset.
    pub fn fail_commits(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_commits = fail;
        }
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.state.lock().map(|s| s.commits).unwrap_or_default()
    }

    /// The stored checkpoint.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        self.state
            .lock()
            .map(|s| s.checkpoint.clone())
            .unwrap_or_default()
    }

    /// The stored copy of one log entry.
    #[must_use]
    pub fn wal_entry(&self, offset: u64) -> Option<WalEntry> {
        self.state.lock().ok()?.wal.get(&offset).cloned()
    }
}

impl Persistence for MemoryStore {
    fn load(&self) -> StorageResult<PersistedState> {
        let state = self.lock()?;
        Ok(PersistedState {
            snapshots: state.snapshots.values().cloned().collect(),
            checkpoint: state.checkpoint.clone(),
            wal: state.wal.values().cloned().collect(),
            last_offset: state.last_offset,
        })
    }

    fn append_wal(&self, entry: &WalEntry) -> StorageResult<()> {
        let mut state = self.lock()?;
        if state.fail_appends {
            return Err(StorageError::Durability("injected append failure".into()));
        }
        if state.wal.contains_key(&entry.offset()) {
            return Err(StorageError::InvalidData(format!(
                "offset {} already written",
                entry.offset()
            )));
        }
        state.last_offset = state.last_offset.max(entry.offset());
        state.wal.insert(entry.offset(), entry.clone());
        Ok(())
    }

    fn update_wal(&self, entry: &WalEntry) -> StorageResult<()> {
        let mut state = self.lock()?;
        match state.wal.get_mut(&entry.offset()) {
            Some(stored) => {
                *stored = entry.clone();
                Ok(())
            }
            None => Err(StorageError::EntryNotFound(entry.id())),
        }
    }

    fn remove_wal(&self, offsets: &[u64]) -> StorageResult<()> {
        let mut state = self.lock()?;
        for offset in offsets {
            state.wal.remove(offset);
        }
        Ok(())
    }

    fn commit(&self, snapshots: &[Snapshot], checkpoint: &Checkpoint) -> StorageResult<()> {
        let mut state = self.lock()?;
        if state.fail_commits {
            return Err(StorageError::Durability("injected commit failure".into()));
        }
        for snapshot in snapshots {
            state.snapshots.insert(snapshot.entity_id, snapshot.clone());
        }
        state.checkpoint = checkpoint.clone();
        state.commits += 1;
        Ok(())
    }
}
