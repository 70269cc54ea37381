//! Sync coordinator: drains the local log to the remote and merges the
//! remote's operations back in.
//!
//! One sync call moves through `Idle → Draining → Pulling → Merging → Idle`.
//! Any transport failure moves the coordinator to `Offline`; the next sync
//! attempt (or `set_online(true)`) brings it back to `Idle`.
//!
//! The merge step is synchronous. It works on copies of the touched
//! projections and commits their snapshots together with the new checkpoint
//! in one persistence transaction; the in-memory state is swapped only after
//! that commit succeeds. A cancelled or failed sync therefore never leaves a
//! half-applied batch behind.

use crate::error::{SyncError, SyncResult, lock};
use crate::presenter::{ConflictPresenter, UserResolution};
use crate::projection::{Projection, RemoteEffect};
use crate::replica::Replica;
use crate::resolver::ConflictRecord;
use crate::transport::{PullBatch, Transport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tandem_storage::{Checkpoint, EntryStatus, RetryPolicy, WalEntry};
use tandem_types::{EntityId, Operation, OperationId, VectorClock};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, warn};

/// Where the coordinator is in its cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Draining,
    Pulling,
    Merging,
    Offline,
}

/// Counters for one sync call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Log entries acknowledged by the remote.
    pub pushed: usize,
    /// Log entries that exhausted their retries during this call.
    pub failed: usize,
    pub pulled: usize,
    pub applied: usize,
    /// Own echoes and repeats within one pulled batch.
    pub duplicates: usize,
    /// Operations left waiting for causal dependencies.
    pub deferred: usize,
    pub quarantined: usize,
    /// Remote writes rejected by first-write-wins.
    pub rejected: usize,
    /// Local first-write-wins writes that lost to an earlier remote write.
    /// Each record names the local value that was replaced.
    pub version_conflicts: Vec<ConflictRecord>,
    /// Conflicts handed to the presenter.
    pub awaiting_user: usize,
    /// User answers written back as local operations.
    pub user_resolved: usize,
}

/// A pulled operation that could not be applied and was set aside.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantinedOperation {
    pub operation: Operation,
    pub reason: String,
}

struct AwaitingChoice {
    record: ConflictRecord,
    answer: oneshot::Receiver<UserResolution>,
}

/// Resets the phase to `Idle` when a sync call ends, unless it went offline.
struct PhaseGuard<'a> {
    phase: &'a Mutex<SyncPhase>,
}

impl<'a> PhaseGuard<'a> {
    fn enter(phase: &'a Mutex<SyncPhase>) -> Self {
        *lock_phase(phase) = SyncPhase::Idle;
        Self { phase }
    }

    fn set(&self, next: SyncPhase) {
        let mut phase = lock_phase(self.phase);
        debug!(from = ?*phase, to = ?next, "sync phase");
        *phase = next;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        let mut phase = lock_phase(self.phase);
        if *phase != SyncPhase::Offline {
            *phase = SyncPhase::Idle;
        }
    }
}

fn lock_phase(phase: &Mutex<SyncPhase>) -> MutexGuard<'_, SyncPhase> {
    phase.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives synchronization of one replica against one transport.
pub struct SyncCoordinator {
    replica: Arc<Replica>,
    transport: Arc<dyn Transport>,
    presenter: Option<Arc<dyn ConflictPresenter>>,
    /// Serializes sync calls.
    gate: tokio::sync::Mutex<()>,
    phase: Mutex<SyncPhase>,
    online: AtomicBool,
    consecutive_failures: AtomicU32,
    quarantine: Mutex<Vec<QuarantinedOperation>>,
    awaiting: Mutex<Vec<AwaitingChoice>>,
}

impl SyncCoordinator {
    pub fn new(replica: Arc<Replica>, transport: Arc<dyn Transport>) -> Self {
        Self {
            replica,
            transport,
            presenter: None,
            gate: tokio::sync::Mutex::new(()),
            phase: Mutex::new(SyncPhase::Idle),
            online: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            quarantine: Mutex::new(Vec::new()),
            awaiting: Mutex::new(Vec::new()),
        }
    }

    /// Attaches a conflict UI. Without one, `UserChoice` conflicts are
    /// settled with the configured fallback strategy.
    #[must_use]
    pub fn with_presenter(mut self, presenter: Arc<dyn ConflictPresenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }

    #[must_use]
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        *lock_phase(&self.phase)
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Marks the transport as reachable or not. Going online from `Offline`
    /// returns the coordinator to `Idle`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
        let mut phase = lock_phase(&self.phase);
        if online && *phase == SyncPhase::Offline {
            *phase = SyncPhase::Idle;
        } else if !online {
            *phase = SyncPhase::Offline;
        }
        info!(online, "connectivity changed");
    }

    /// Suggested wait before the next sync attempt: zero after a success,
    /// jittered exponential backoff after consecutive failures.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        match self.consecutive_failures.load(Ordering::Acquire) {
            0 => Duration::ZERO,
            n => self.replica.config().retry_policy().delay(n),
        }
    }

    /// Conflicts waiting for a user answer.
    pub fn pending_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        Ok(lock(&self.awaiting, "awaiting")?
            .iter()
            .map(|choice| choice.record.clone())
            .collect())
    }

    /// Pulled operations that were malformed or inapplicable.
    pub fn quarantined(&self) -> SyncResult<Vec<QuarantinedOperation>> {
        Ok(lock(&self.quarantine, "quarantine")?.clone())
    }

    /// Snapshots all projections and compacts the log.
    pub fn compact(&self) -> SyncResult<usize> {
        self.replica.compact()
    }

    /// Runs one full sync cycle.
    ///
    /// Retryable failures (network, timeout) leave the coordinator `Offline`
    /// and every unacknowledged log entry `Pending`; nothing pulled in a
    /// failed cycle is committed.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        let _gate = self.gate.lock().await;
        if !self.is_online() {
            *lock_phase(&self.phase) = SyncPhase::Offline;
            return Err(SyncError::Offline);
        }

        let phase = PhaseGuard::enter(&self.phase);
        let mut report = SyncReport::default();
        let result = self.run(&phase, &mut report).await;
        match &result {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Release);
                info!(
                    pushed = report.pushed,
                    pulled = report.pulled,
                    applied = report.applied,
                    deferred = report.deferred,
                    "sync complete"
                );
            }
            Err(e) if e.is_retryable() => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                phase.set(SyncPhase::Offline);
                warn!("Sync failed ({} in a row), going offline: {}", failures, e);
            }
            Err(e) => {
                warn!("Sync aborted: {}", e);
            }
        }
        result.map(|()| report)
    }

    async fn run(&self, phase: &PhaseGuard<'_>, report: &mut SyncReport) -> SyncResult<()> {
        report.user_resolved += self.apply_user_resolutions()?;

        phase.set(SyncPhase::Draining);
        self.drain(report).await?;

        let batch_size = self.replica.config().batch_size;
        loop {
            phase.set(SyncPhase::Pulling);
            let since = self.replica.remote_cursor()?;
            let batch = self.call(self.transport.pull(since, batch_size)).await?;
            let received = batch.operations.len();
            report.pulled += received;

            phase.set(SyncPhase::Merging);
            let cursor = batch.cursor;
            let awaiting = self.merge(batch, report)?;
            report.awaiting_user += self.present(awaiting)?;

            if received == 0 || cursor <= since {
                break;
            }
        }
        Ok(())
    }

    async fn call<T>(&self, request: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        tokio::time::timeout(self.replica.config().timeout(), request)
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    // ── Draining ────────────────────────────────────────────────────

    async fn drain(&self, report: &mut SyncReport) -> SyncResult<()> {
        let config = self.replica.config();
        let policy = config.retry_policy();
        let wal = self.replica.wal();
        let now = Utc::now();
        // Entries reach the remote in log order: one that is backing off or
        // exhausted holds back everything after it.
        let due: Vec<WalEntry> = wal
            .entries()?
            .into_iter()
            .filter(|e| e.status != EntryStatus::Synced)
            .take_while(|e| e.is_due(now))
            .collect();
        if due.is_empty() {
            return Ok(());
        }
        debug!(due = due.len(), "draining wal");

        for chunk in due.chunks(config.batch_size) {
            let operations: Vec<Operation> = chunk.iter().map(|e| e.operation.clone()).collect();
            match self.call(self.transport.push(&operations)).await {
                Ok(ack) => {
                    let accepted: HashSet<OperationId> = ack.accepted.into_iter().collect();
                    let mut held_back = false;
                    for entry in chunk {
                        if accepted.contains(&entry.id()) {
                            wal.mark_synced(entry.id())?;
                            report.pushed += 1;
                        } else {
                            self.record_failure(entry, "not acknowledged", &policy, report)?;
                            held_back = true;
                        }
                    }
                    if held_back {
                        debug!("remote left entries unacknowledged; holding back the rest");
                        return Ok(());
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    for entry in chunk {
                        self.record_failure(entry, &reason, &policy, report)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn record_failure(
        &self,
        entry: &WalEntry,
        reason: &str,
        policy: &RetryPolicy,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        if self.replica.wal().mark_failed(entry.id(), reason, policy)? == EntryStatus::Failed {
            report.failed += 1;
        }
        Ok(())
    }

    // ── Merging ─────────────────────────────────────────────────────

    /// Applies a pulled batch (plus anything deferred earlier) atomically.
    /// Returns the conflicts that need a user answer.
    fn merge(&self, batch: PullBatch, report: &mut SyncReport) -> SyncResult<Vec<ConflictRecord>> {
        let replica = &self.replica;
        let own = replica.id();
        let mut checkpoint = replica.lock_checkpoint()?;
        let own_sequence = replica.clock()?.get(&own);

        let mut candidates = checkpoint.deferred.clone();
        candidates.extend(batch.operations);

        let mut handles = BTreeMap::new();
        let mut seen = HashSet::new();
        let mut pending = Vec::with_capacity(candidates.len());
        for op in candidates {
            if op.origin() == own || !seen.insert(op.id) {
                report.duplicates += 1;
                continue;
            }
            let claimed = op.timestamp.get(&own);
            let screened = op
                .check_well_formed()
                .map_err(SyncError::Config)
                .and_then(|()| {
                    if claimed > own_sequence {
                        Err(SyncError::Config(format!(
                            "depends on local event {claimed}, but this replica is at {own_sequence}"
                        )))
                    } else {
                        Ok(())
                    }
                })
                .and_then(|()| replica.schema(&op.entity_type))
                .and_then(|schema| replica.projection(op.entity_id, schema));
            match screened {
                Ok(handle) => {
                    handles.entry(op.entity_id).or_insert(handle);
                    pending.push(op);
                }
                Err(e) => self.quarantine(op, e.to_string(), report)?,
            }
        }

        // Projections are locked in entity order, then the tracker.
        let mut guards = BTreeMap::new();
        for (id, handle) in &handles {
            guards.insert(*id, lock(handle, "projection")?);
        }
        let mut working: BTreeMap<EntityId, Projection> = guards
            .iter()
            .map(|(id, guard)| (*id, Projection::clone(guard)))
            .collect();
        let mut tracker_guard = replica.lock_tracker()?;
        let mut tracker = tracker_guard.clone();

        let presenter_attached = self.presenter.is_some();
        let mut touched = BTreeSet::new();
        let mut awaiting = Vec::new();
        loop {
            let mut progressed = false;
            let mut blocked = Vec::new();
            for op in pending {
                if !is_ready(&op, tracker.clock()) {
                    blocked.push(op);
                    continue;
                }
                let (Some(projection), Ok(schema)) =
                    (working.get_mut(&op.entity_id), replica.schema(&op.entity_type))
                else {
                    blocked.push(op);
                    continue;
                };
                match projection.apply_remote(&op, schema, replica.resolver(), presenter_attached) {
                    Ok(effect) => {
                        match effect {
                            RemoteEffect::Applied | RemoteEffect::Unchanged => {}
                            RemoteEffect::Rejected(record) => {
                                info!(
                                    "Rejected stale write to {}/{} from {}",
                                    record.entity_id, record.field, op.id
                                );
                                report.rejected += 1;
                            }
                            RemoteEffect::Displaced(record) => {
                                warn!(
                                    "Local write to {}/{} lost a first-write race to {}",
                                    record.entity_id, record.field, op.id
                                );
                                report.version_conflicts.push(record);
                            }
                            RemoteEffect::AwaitingUser(record) => awaiting.push(record),
                        }
                        tracker.merge(&op.timestamp);
                        touched.insert(op.entity_id);
                        report.applied += 1;
                        progressed = true;
                    }
                    Err(e) => self.quarantine(op, e.to_string(), report)?,
                }
            }
            pending = blocked;
            if !progressed || pending.is_empty() {
                break;
            }
        }

        report.deferred = pending.len();
        if !pending.is_empty() {
            debug!(deferred = pending.len(), "operations waiting for causal dependencies");
        }
        let next = Checkpoint {
            remote_cursor: batch.cursor.max(checkpoint.remote_cursor),
            clock: tracker.clock().clone(),
            deferred: pending,
        };
        if touched.is_empty() && next == *checkpoint {
            return Ok(awaiting);
        }

        let snapshots = touched
            .iter()
            .filter_map(|id| working.get(id))
            .map(Projection::to_snapshot)
            .collect::<SyncResult<Vec<_>>>()?;
        replica.wal().store().commit(&snapshots, &next)?;

        for id in &touched {
            if let (Some(guard), Some(projection)) = (guards.get_mut(id), working.remove(id)) {
                **guard = projection;
            }
        }
        *tracker_guard = tracker;
        *checkpoint = next;
        debug!(
            snapshots = snapshots.len(),
            cursor = checkpoint.remote_cursor,
            "merge committed"
        );
        Ok(awaiting)
    }

    fn quarantine(&self, operation: Operation, reason: String, report: &mut SyncReport) -> SyncResult<()> {
        warn!("Quarantining operation {}: {}", operation.id, reason);
        report.quarantined += 1;
        lock(&self.quarantine, "quarantine")?.push(QuarantinedOperation { operation, reason });
        Ok(())
    }

    // ── User choice ─────────────────────────────────────────────────

    fn present(&self, records: Vec<ConflictRecord>) -> SyncResult<usize> {
        let Some(presenter) = &self.presenter else {
            return Ok(0);
        };
        if records.is_empty() {
            return Ok(0);
        }
        let mut presented = 0;
        let mut awaiting = lock(&self.awaiting, "awaiting")?;
        for record in records {
            let shown = awaiting.iter().any(|choice| {
                choice.record.entity_id == record.entity_id
                    && choice.record.field == record.field
                    && choice.record.remote_stamp == record.remote_stamp
            });
            if shown {
                continue;
            }
            info!("Presenting conflict on {}/{}", record.entity_id, record.field);
            let answer = presenter.present_conflict(record.clone());
            awaiting.push(AwaitingChoice { record, answer });
            presented += 1;
        }
        Ok(presented)
    }

    /// Writes every answered conflict back as a local field write, which
    /// supersedes both conflicting values. Called at the start of each sync.
    /// Returns the number of conflicts settled.
    pub fn apply_user_resolutions(&self) -> SyncResult<usize> {
        let mut settled = Vec::new();
        {
            let mut awaiting = lock(&self.awaiting, "awaiting")?;
            let mut still_open = Vec::with_capacity(awaiting.len());
            for mut choice in awaiting.drain(..) {
                match choice.answer.try_recv() {
                    Ok(answer) => {
                        let value = match answer {
                            UserResolution::KeepLocal => choice.record.local_value.clone(),
                            UserResolution::TakeRemote => choice.record.remote_value.clone(),
                            UserResolution::Value(value) => value,
                        };
                        settled.push((choice.record, value));
                    }
                    Err(TryRecvError::Empty) => still_open.push(choice),
                    Err(TryRecvError::Closed) => {
                        warn!(
                            "Conflict presenter dropped {}/{}; settling with fallback",
                            choice.record.entity_id, choice.record.field
                        );
                        let value = self.replica.resolver().settle(&choice.record)?;
                        settled.push((choice.record, value));
                    }
                }
            }
            *awaiting = still_open;
        }

        for (record, value) in &settled {
            self.replica.set_field(
                &record.entity_type,
                record.entity_id,
                &record.field,
                value.clone(),
                None,
            )?;
        }
        Ok(settled.len())
    }
}

/// Ready when every non-origin clock entry has already been observed.
fn is_ready(op: &Operation, observed: &VectorClock) -> bool {
    let origin = op.origin();
    op.timestamp
        .entries()
        .all(|(replica, time)| *replica == origin || observed.get(replica) >= *time)
}
