//! The write-ahead operation log.
//!
//! Every local mutation is appended here before it touches a projection, and
//! the sync coordinator drains it to the remote. The in-memory index mirrors
//! the durable store: a change reaches the index only after the persistence
//! port has accepted it, so a failed write leaves both untouched.

use crate::error::{StorageError, StorageResult};
use crate::persistence::{Checkpoint, Persistence, Snapshot};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tandem_types::{Operation, OperationId};
use tracing::{debug, info, warn};

/// Replication status of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Not yet acknowledged by the remote.
    Pending,
    /// Acknowledged; eligible for compaction.
    Synced,
    /// Gave up after `max_retries`; waits for a manual requeue.
    Failed,
}

impl EntryStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            other => Err(StorageError::InvalidData(format!("unknown entry status: {other}"))),
        }
    }
}

/// One record of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub operation: Operation,
    pub status: EntryStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Earliest time the next push may be attempted.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub appended_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl WalEntry {
    /// A fresh pending entry.
    #[must_use]
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            status: EntryStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            appended_at: Utc::now(),
            synced_at: None,
        }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.operation.wal_offset
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.operation.id
    }

    /// Whether the entry is pending and its backoff has elapsed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Retry schedule for failed pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures after which an entry becomes `Failed`.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay after the `attempt`-th failure (1-based):
    /// `base * 2^(attempt-1)`, capped at `backoff_max`.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Jittered delay: uniformly drawn from the upper half of the ceiling.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        let half = ceiling / 2;
        let jitter = if ceiling > half {
            rand::thread_rng().gen_range(0..=ceiling - half)
        } else {
            0
        };
        Duration::from_millis(half + jitter)
    }
}

#[derive(Debug, Default)]
struct WalIndex {
    entries: BTreeMap<u64, WalEntry>,
    by_id: HashMap<OperationId, u64>,
    last_offset: u64,
}

impl WalIndex {
    fn entry(&self, id: OperationId) -> StorageResult<&WalEntry> {
        self.by_id
            .get(&id)
            .and_then(|offset| self.entries.get(offset))
            .ok_or(StorageError::EntryNotFound(id))
    }

    fn put(&mut self, entry: WalEntry) {
        self.by_id.insert(entry.id(), entry.offset());
        self.entries.insert(entry.offset(), entry);
    }
}

/// State handed back by [`Wal::recover`] for projection replay.
#[derive(Debug)]
pub struct Recovery {
    pub wal: Wal,
    pub snapshots: Vec<Snapshot>,
    pub checkpoint: Checkpoint,
}

/// Append-only operation log over a [`Persistence`] port.
pub struct Wal {
    store: Arc<dyn Persistence>,
    index: Mutex<WalIndex>,
}

impl fmt::Debug for Wal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wal").finish_non_exhaustive()
    }
}

impl Wal {
    /// Opens the log, rebuilding the index from the store.
    pub fn open(store: Arc<dyn Persistence>) -> StorageResult<Self> {
        Ok(Self::recover(store)?.wal)
    }

    /// Opens the log and also returns the last committed snapshots and
    /// checkpoint. Replay starts from the oldest surviving entry.
    pub fn recover(store: Arc<dyn Persistence>) -> StorageResult<Recovery> {
        let state = store.load()?;
        let mut index = WalIndex {
            last_offset: state.last_offset,
            ..WalIndex::default()
        };
        for entry in state.wal {
            index.last_offset = index.last_offset.max(entry.offset());
            index.put(entry);
        }
        info!(
            entries = index.entries.len(),
            last_offset = index.last_offset,
            snapshots = state.snapshots.len(),
            "write-ahead log recovered"
        );
        Ok(Recovery {
            wal: Self {
                store,
                index: Mutex::new(index),
            },
            snapshots: state.snapshots,
            checkpoint: state.checkpoint,
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, WalIndex>> {
        self.index.lock().map_err(|_| StorageError::poisoned())
    }

    /// The persistence port behind this log.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Durably appends an operation and returns its offset.
    ///
    /// The operation's `wal_offset` is assigned here. Appending an operation
    /// ID that is already logged returns the existing offset. A store
    /// failure is returned as-is and leaves the log unchanged.
    pub fn append(&self, mut operation: Operation) -> StorageResult<u64> {
        let mut index = self.lock()?;
        if let Some(offset) = index.by_id.get(&operation.id) {
            return Ok(*offset);
        }
        let offset = index.last_offset + 1;
        operation.wal_offset = offset;
        let entry = WalEntry::new(operation);
        self.store.append_wal(&entry)?;
        debug!(offset, id = %entry.id(), kind = entry.operation.payload.kind(), "appended to wal");
        index.last_offset = offset;
        index.put(entry);
        Ok(offset)
    }

    /// Highest offset ever assigned.
    pub fn last_offset(&self) -> StorageResult<u64> {
        Ok(self.lock()?.last_offset)
    }

    /// Looks up an entry by operation ID.
    pub fn get(&self, id: OperationId) -> StorageResult<Option<WalEntry>> {
        let index = self.lock()?;
        Ok(index.entry(id).ok().cloned())
    }

    /// Every surviving entry in append order.
    pub fn entries(&self) -> StorageResult<Vec<WalEntry>> {
        Ok(self.lock()?.entries.values().cloned().collect())
    }

    /// Number of surviving entries.
    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Counts entries per status: `(pending, synced, failed)`.
    pub fn status_counts(&self) -> StorageResult<(usize, usize, usize)> {
        let index = self.lock()?;
        let mut counts = (0, 0, 0);
        for entry in index.entries.values() {
            match entry.status {
                EntryStatus::Pending => counts.0 += 1,
                EntryStatus::Synced => counts.1 += 1,
                EntryStatus::Failed => counts.2 += 1,
            }
        }
        Ok(counts)
    }

    /// Lazily iterates `Pending` entries with an offset greater than
    /// `offset`, in append order.
    ///
    /// Each step consults the live index, so entries appended while
    /// iterating are picked up and entries that changed status are skipped.
    /// Resume an interrupted drain with [`PendingEntries::last_offset`].
    #[must_use]
    pub fn pending_since(&self, offset: u64) -> PendingEntries<'_> {
        PendingEntries {
            wal: self,
            cursor: offset,
        }
    }

    /// Applies a compare-and-set transition from `expected`, persisting the
    /// updated entry before the index changes.
    fn transition(
        &self,
        id: OperationId,
        expected: EntryStatus,
        update: impl FnOnce(&mut WalEntry),
    ) -> StorageResult<WalEntry> {
        let mut index = self.lock()?;
        let current = index.entry(id)?;
        if current.status != expected {
            return Err(StorageError::StaleTransition {
                id,
                expected,
                actual: current.status,
            });
        }
        let mut next = current.clone();
        update(&mut next);
        self.store.update_wal(&next)?;
        index.put(next.clone());
        Ok(next)
    }

    /// Marks a pending entry as acknowledged by the remote. Acknowledging an
    /// already synced entry is a no-op.
    pub fn mark_synced(&self, id: OperationId) -> StorageResult<()> {
        match self.transition(id, EntryStatus::Pending, |entry| {
            entry.status = EntryStatus::Synced;
            entry.synced_at = Some(Utc::now());
            entry.next_attempt_at = None;
            entry.last_error = None;
        }) {
            Ok(entry) => {
                debug!(offset = entry.offset(), %id, "wal entry synced");
                Ok(())
            }
            Err(StorageError::StaleTransition {
                actual: EntryStatus::Synced,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Records a failed push of a pending entry.
    ///
    /// Increments the retry count and schedules the next attempt with
    /// jittered exponential backoff. Once `max_retries` is reached the entry
    /// becomes `Failed` and is no longer drained. Returns the new status.
    pub fn mark_failed(
        &self,
        id: OperationId,
        reason: &str,
        policy: &RetryPolicy,
    ) -> StorageResult<EntryStatus> {
        let now = Utc::now();
        let entry = self.transition(id, EntryStatus::Pending, |entry| {
            entry.retry_count += 1;
            entry.last_error = Some(reason.to_string());
            if entry.retry_count >= policy.max_retries {
                entry.status = EntryStatus::Failed;
                entry.next_attempt_at = None;
            } else {
                let delay = policy.delay(entry.retry_count);
                entry.next_attempt_at = Some(
                    chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                );
            }
        })?;
        if entry.status == EntryStatus::Failed {
            warn!(
                offset = entry.offset(),
                %id,
                retries = entry.retry_count,
                reason,
                "wal entry failed permanently"
            );
        } else {
            debug!(offset = entry.offset(), %id, retries = entry.retry_count, reason, "push failed, backing off");
        }
        Ok(entry.status)
    }

    /// Moves a `Failed` entry back to `Pending` with a fresh retry budget.
    pub fn requeue(&self, id: OperationId) -> StorageResult<()> {
        let entry = self.transition(id, EntryStatus::Failed, |entry| {
            entry.status = EntryStatus::Pending;
            entry.retry_count = 0;
            entry.next_attempt_at = None;
        })?;
        info!(offset = entry.offset(), %id, "wal entry requeued");
        Ok(())
    }

    /// Removes `Synced` entries below `before_offset` that were acknowledged
    /// longer than `retention_horizon` ago. `Pending` and `Failed` entries
    /// always survive. Returns the number of entries removed.
    pub fn compact(&self, before_offset: u64, retention_horizon: Duration) -> StorageResult<usize> {
        let cutoff = chrono::Duration::from_std(retention_horizon)
            .ok()
            .and_then(|horizon| Utc::now().checked_sub_signed(horizon))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut index = self.lock()?;
        let doomed: Vec<u64> = index
            .entries
            .range(..before_offset)
            .filter(|(_, e)| e.status == EntryStatus::Synced)
            .filter(|(_, e)| e.synced_at.is_some_and(|at| at <= cutoff))
            .map(|(offset, _)| *offset)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        self.store.remove_wal(&doomed)?;
        for offset in &doomed {
            if let Some(entry) = index.entries.remove(offset) {
                index.by_id.remove(&entry.id());
            }
        }
        info!(removed = doomed.len(), before_offset, "wal compacted");
        Ok(doomed.len())
    }
}

/// Lazy, restartable iterator over pending entries. See [`Wal::pending_since`].
pub struct PendingEntries<'a> {
    wal: &'a Wal,
    cursor: u64,
}

impl PendingEntries<'_> {
    /// Offset of the last entry yielded (or the starting offset).
    #[must_use]
    pub fn last_offset(&self) -> u64 {
        self.cursor
    }
}

impl Iterator for PendingEntries<'_> {
    type Item = WalEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.wal.index.lock().ok()?;
        let entry = index
            .entries
            .range(self.cursor.saturating_add(1)..)
            .map(|(_, e)| e)
            .find(|e| e.status == EntryStatus::Pending)?
            .clone();
        self.cursor = entry.offset();
        Some(entry)
    }
}
