//! The replica: local mutation API, projections and crash recovery.
//!
//! Every local mutation follows the same path: plan the payload against the
//! current projection, stamp it with the causality tracker, append it to the
//! write-ahead log, and only then apply it. A mutation whose append fails
//! leaves the projection untouched.
//!
//! Each projection has its own mutex, so mutations of different documents do
//! not wait on each other beyond the brief stamp-and-append step.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult, lock};
use crate::projection::{Projection, ProjectionState};
use crate::resolver::ConflictResolver;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_crdt::{CausalityTracker, CrdtDocument, CrdtState, DocumentValue};
use tandem_model::{ConflictStrategy, Entity, EntitySchema, MergeHandler};
use tandem_storage::{Checkpoint, Persistence, Recovery, Wal};
use tandem_types::{EntityId, Operation, OperationPayload, ReplicaId, VectorClock};
use tracing::{debug, info, warn};

type Handle = Arc<Mutex<Projection>>;

struct Slot {
    entity_type: String,
    handle: Handle,
}

/// One replica of the data set.
pub struct Replica {
    id: ReplicaId,
    config: SyncConfig,
    wal: Wal,
    tracker: Mutex<CausalityTracker>,
    projections: Mutex<HashMap<EntityId, Slot>>,
    /// Guards every commit of snapshots and the checkpoint.
    checkpoint: Mutex<Checkpoint>,
    resolver: ConflictResolver,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("wal", &self.wal)
            .finish_non_exhaustive()
    }
}

impl Replica {
    /// Opens a replica over `persistence`, rebuilding every projection from
    /// its last snapshot plus the log entries the snapshot does not cover.
    pub fn open(
        id: ReplicaId,
        config: SyncConfig,
        persistence: Arc<dyn Persistence>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let Recovery {
            wal,
            snapshots,
            checkpoint,
        } = Wal::recover(persistence)?;

        let mut projections: HashMap<EntityId, Projection> = HashMap::new();
        for snapshot in &snapshots {
            projections.insert(snapshot.entity_id, Projection::from_snapshot(snapshot)?);
        }

        let mut tracker = CausalityTracker::with_clock(id, checkpoint.clock.clone());
        let mut replayed = 0usize;
        for entry in wal.entries()? {
            let op = &entry.operation;
            tracker.restore(&op.timestamp);
            let Some(schema) = config.schema(&op.entity_type) else {
                warn!("Skipping replay of {}: entity type {} is no longer declared", op.id, op.entity_type);
                continue;
            };
            let projection = projections
                .entry(op.entity_id)
                .or_insert_with(|| Projection::new(op.entity_id, schema));
            if op.wal_offset <= projection.covered_offset {
                continue;
            }
            projection.apply_local(op)?;
            replayed += 1;
        }

        info!(
            replica = %id,
            projections = projections.len(),
            replayed,
            deferred = checkpoint.deferred.len(),
            "replica opened"
        );

        let resolver = ConflictResolver::new(config.fallback_strategy.clone());
        Ok(Self {
            id,
            config,
            wal,
            tracker: Mutex::new(tracker),
            projections: Mutex::new(
                projections
                    .into_iter()
                    .map(|(id, p)| {
                        let slot = Slot {
                            entity_type: p.entity_type.clone(),
                            handle: Arc::new(Mutex::new(p)),
                        };
                        (id, slot)
                    })
                    .collect(),
            ),
            checkpoint: Mutex::new(checkpoint),
            resolver,
        })
    }

    /// Registers a merge handler for `FieldRule::Custom` fields.
    #[must_use]
    pub fn with_merge_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn MergeHandler>,
    ) -> Self {
        self.resolver.register(name, handler);
        self
    }

    #[must_use]
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    /// The current vector clock.
    pub fn clock(&self) -> SyncResult<VectorClock> {
        Ok(lock(&self.tracker, "tracker")?.clock().clone())
    }

    /// Position in the remote stream up to which state has been committed.
    pub fn remote_cursor(&self) -> SyncResult<u64> {
        Ok(lock(&self.checkpoint, "checkpoint")?.remote_cursor)
    }

    /// Pulled operations still waiting for causal dependencies.
    pub fn deferred(&self) -> SyncResult<Vec<Operation>> {
        Ok(lock(&self.checkpoint, "checkpoint")?.deferred.clone())
    }

    // ── Counters ────────────────────────────────────────────────────

    /// Adds `amount` to a counter and returns the new value.
    pub fn increment(&self, entity_type: &str, entity_id: EntityId, amount: u64) -> SyncResult<i64> {
        self.mutate(entity_type, entity_id, |projection, schema| {
            let delta = i64::try_from(amount).unwrap_or(i64::MAX);
            let payload = match document(projection, schema, "increment")?.crdt() {
                CrdtState::GCounter(counter) => OperationPayload::Counter {
                    delta,
                    positive: counter.slot(&self.id).saturating_add(amount),
                    negative: 0,
                },
                CrdtState::PnCounter(counter) => {
                    let (positive, negative) = counter.slots(&self.id);
                    OperationPayload::Counter {
                        delta,
                        positive: positive.saturating_add(amount),
                        negative,
                    }
                }
                _ => return Err(mismatch(schema, "increment")),
            };
            Ok(Some(payload))
        })?;
        Ok(self.counter_value(entity_id)?.unwrap_or_default())
    }

    /// Subtracts `amount` from a PN-counter and returns the new value.
    pub fn decrement(&self, entity_type: &str, entity_id: EntityId, amount: u64) -> SyncResult<i64> {
        self.mutate(entity_type, entity_id, |projection, schema| {
            let CrdtState::PnCounter(counter) = document(projection, schema, "decrement")?.crdt()
            else {
                return Err(mismatch(schema, "decrement"));
            };
            let (positive, negative) = counter.slots(&self.id);
            Ok(Some(OperationPayload::Counter {
                delta: -i64::try_from(amount).unwrap_or(i64::MAX),
                positive,
                negative: negative.saturating_add(amount),
            }))
        })?;
        Ok(self.counter_value(entity_id)?.unwrap_or_default())
    }

    // ── Sets ────────────────────────────────────────────────────────

    pub fn add_to_set(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        element: impl Into<String>,
    ) -> SyncResult<()> {
        let element = element.into();
        self.mutate(entity_type, entity_id, |projection, schema| {
            lww_set(projection, schema, "set_add")?;
            Ok(Some(OperationPayload::SetAdd { element }))
        })?;
        Ok(())
    }

    pub fn remove_from_set(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        element: impl Into<String>,
    ) -> SyncResult<()> {
        let element = element.into();
        self.mutate(entity_type, entity_id, |projection, schema| {
            lww_set(projection, schema, "set_remove")?;
            Ok(Some(OperationPayload::SetRemove { element }))
        })?;
        Ok(())
    }

    // ── Text ────────────────────────────────────────────────────────

    /// Inserts `text` before the character at visible `index`; indices past
    /// the end append.
    pub fn insert_text(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        index: usize,
        text: &str,
    ) -> SyncResult<()> {
        let chars: Vec<char> = text.chars().collect();
        self.mutate(entity_type, entity_id, |projection, schema| {
            let CrdtState::Text(rga) = document(projection, schema, "text_insert")?.crdt() else {
                return Err(mismatch(schema, "text_insert"));
            };
            if chars.is_empty() {
                return Ok(None);
            }
            let (origin, chars) = rga.plan_insert(self.id, index, &chars);
            Ok(Some(OperationPayload::TextInsert { origin, chars }))
        })?;
        Ok(())
    }

    /// Deletes up to `count` visible characters starting at `start`.
    pub fn delete_text(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        start: usize,
        count: usize,
    ) -> SyncResult<()> {
        self.mutate(entity_type, entity_id, |projection, schema| {
            let CrdtState::Text(rga) = document(projection, schema, "text_delete")?.crdt() else {
                return Err(mismatch(schema, "text_delete"));
            };
            let ids = rga.plan_delete(start, count);
            Ok((!ids.is_empty()).then_some(OperationPayload::TextDelete { ids }))
        })?;
        Ok(())
    }

    // ── Plain entities ──────────────────────────────────────────────

    /// Writes one field and returns its new version.
    ///
    /// Under first-write-wins, `expected_version` is checked against the
    /// current version and a mismatch fails with
    /// [`SyncError::VersionConflict`]. Other strategies ignore it.
    pub fn set_field(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        field: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> SyncResult<u64> {
        let mut version = 0;
        self.mutate(entity_type, entity_id, |projection, schema| {
            let entity = entity(projection, schema, "field_set")?;
            let current = entity.version(field);
            if let (ConflictStrategy::FirstWriteWins, Some(expected)) =
                (&schema.strategy, expected_version)
            {
                if expected != current {
                    return Err(SyncError::VersionConflict {
                        entity_id,
                        field: field.to_owned(),
                        expected,
                        actual: current,
                    });
                }
            }
            version = current + 1;
            Ok(Some(OperationPayload::FieldSet {
                field: field.to_owned(),
                value,
                base_version: current,
            }))
        })?;
        Ok(version)
    }

    /// Deletes a plain entity. Whether a concurrent update revives it is
    /// decided by the type's delete policy.
    pub fn delete_entity(&self, entity_type: &str, entity_id: EntityId) -> SyncResult<()> {
        self.mutate(entity_type, entity_id, |projection, schema| {
            entity(projection, schema, "entity_delete")?;
            Ok(Some(OperationPayload::EntityDelete))
        })?;
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn counter_value(&self, entity_id: EntityId) -> SyncResult<Option<i64>> {
        self.read(entity_id, |p| match p.document()?.value() {
            DocumentValue::Counter(value) => Some(value),
            _ => None,
        })
    }

    pub fn set_members(&self, entity_id: EntityId) -> SyncResult<Option<Vec<String>>> {
        self.read(entity_id, |p| match p.document()?.value() {
            DocumentValue::Set(members) => Some(members),
            _ => None,
        })
    }

    pub fn text(&self, entity_id: EntityId) -> SyncResult<Option<String>> {
        self.read(entity_id, |p| match p.document()?.value() {
            DocumentValue::Text(text) => Some(text),
            _ => None,
        })
    }

    pub fn document(&self, entity_id: EntityId) -> SyncResult<Option<CrdtDocument>> {
        self.read(entity_id, |p| p.document().cloned())
    }

    /// The entity, if it exists under its type's delete policy.
    pub fn entity(&self, entity_id: EntityId) -> SyncResult<Option<Entity>> {
        self.read(entity_id, |p| {
            let entity = p.entity()?;
            let policy = self.config.schema(&p.entity_type)?.delete_policy;
            entity.is_alive(policy).then(|| entity.clone())
        })
    }

    fn read<R>(
        &self,
        entity_id: EntityId,
        f: impl FnOnce(&Projection) -> Option<R>,
    ) -> SyncResult<Option<R>> {
        let handle = lock(&self.projections, "projections")?
            .get(&entity_id)
            .map(|slot| Arc::clone(&slot.handle));
        match handle {
            Some(handle) => Ok(f(&*lock(&handle, "projection")?)),
            None => Ok(None),
        }
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Snapshots every projection and drops synced log entries older than
    /// the retention horizon. Returns the number of entries removed.
    pub fn compact(&self) -> SyncResult<usize> {
        let mut checkpoint = lock(&self.checkpoint, "checkpoint")?;
        let before_offset = self.wal.last_offset()? + 1;
        let mut snapshots = Vec::new();
        for (_, handle) in self.handles()? {
            snapshots.push(lock(&handle, "projection")?.to_snapshot()?);
        }
        // Compacted entries may hold the only record of the local sequence.
        let mut next = checkpoint.clone();
        next.clock.merge(self.lock_tracker()?.clock());
        self.wal.store().commit(&snapshots, &next)?;
        *checkpoint = next;
        let removed = self
            .wal
            .compact(before_offset, self.config.retention_horizon())?;
        info!(snapshots = snapshots.len(), removed, "replica compacted");
        Ok(removed)
    }

    // ── Internals shared with the coordinator ───────────────────────

    pub(crate) fn schema(&self, entity_type: &str) -> SyncResult<&EntitySchema> {
        self.config
            .schema(entity_type)
            .ok_or_else(|| SyncError::UnknownEntityType(entity_type.to_owned()))
    }

    pub(crate) fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub(crate) fn lock_tracker(&self) -> SyncResult<MutexGuard<'_, CausalityTracker>> {
        lock(&self.tracker, "tracker")
    }

    pub(crate) fn lock_checkpoint(&self) -> SyncResult<MutexGuard<'_, Checkpoint>> {
        lock(&self.checkpoint, "checkpoint")
    }

    /// The projection of `entity_id`, created empty if unknown.
    pub(crate) fn projection(&self, entity_id: EntityId, schema: &EntitySchema) -> SyncResult<Handle> {
        let mut projections = lock(&self.projections, "projections")?;
        if let Some(slot) = projections.get(&entity_id) {
            if slot.entity_type != schema.entity_type {
                return Err(SyncError::TypeMismatch {
                    entity_id,
                    existing: slot.entity_type.clone(),
                    requested: schema.entity_type.clone(),
                });
            }
            return Ok(Arc::clone(&slot.handle));
        }
        let handle = Arc::new(Mutex::new(Projection::new(entity_id, schema)));
        projections.insert(
            entity_id,
            Slot {
                entity_type: schema.entity_type.clone(),
                handle: Arc::clone(&handle),
            },
        );
        Ok(handle)
    }

    /// Every projection, ordered by entity ID.
    fn handles(&self) -> SyncResult<Vec<(EntityId, Handle)>> {
        let projections = lock(&self.projections, "projections")?;
        let mut handles: Vec<_> = projections
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(&slot.handle)))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        Ok(handles)
    }

    /// Plans, stamps, logs and applies one local mutation. `plan` returning
    /// `None` means there is nothing to do.
    fn mutate(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        plan: impl FnOnce(&Projection, &EntitySchema) -> SyncResult<Option<OperationPayload>>,
    ) -> SyncResult<Option<Operation>> {
        let schema = self.schema(entity_type)?;
        let handle = self.projection(entity_id, schema)?;
        let mut projection = lock(&handle, "projection")?;
        let Some(payload) = plan(&projection, schema)? else {
            return Ok(None);
        };

        let op = {
            let mut tracker = self.lock_tracker()?;
            let mut op = tracker.stamp(entity_type, entity_id, payload);
            op.wal_offset = self.wal.append(op.clone())?;
            op
        };
        projection.apply_local(&op)?;
        debug!(id = %op.id, entity = %entity_id, kind = op.payload.kind(), "local operation applied");
        Ok(Some(op))
    }
}

fn mismatch(schema: &EntitySchema, operation: &'static str) -> SyncError {
    SyncError::StrategyMismatch {
        entity_type: schema.entity_type.clone(),
        strategy: schema.strategy.name(),
        operation,
    }
}

fn document<'a>(
    projection: &'a Projection,
    schema: &EntitySchema,
    operation: &'static str,
) -> SyncResult<&'a CrdtDocument> {
    match &projection.state {
        ProjectionState::Document(doc) => Ok(doc),
        ProjectionState::Entity(_) => Err(mismatch(schema, operation)),
    }
}

fn entity<'a>(
    projection: &'a Projection,
    schema: &EntitySchema,
    operation: &'static str,
) -> SyncResult<&'a Entity> {
    match &projection.state {
        ProjectionState::Entity(entity) => Ok(entity),
        ProjectionState::Document(_) => Err(mismatch(schema, operation)),
    }
}

fn lww_set(projection: &Projection, schema: &EntitySchema, operation: &'static str) -> SyncResult<()> {
    match document(projection, schema, operation)?.crdt() {
        CrdtState::LwwSet(_) => Ok(()),
        _ => Err(mismatch(schema, operation)),
    }
}
