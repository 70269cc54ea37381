//! In-memory projections: the materialized state of one document or entity.

use crate::error::{SyncError, SyncResult};
use crate::resolver::{ConflictRecord, ConflictResolver, FieldWrite, Resolution};
use serde::{Deserialize, Serialize};
use tandem_crdt::CrdtDocument;
use tandem_model::{Entity, EntitySchema, FieldState};
use tandem_storage::Snapshot;
use tandem_types::{EntityId, Operation, OperationPayload};
use tracing::{debug, warn};

/// What a projection holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "state", rename_all = "snake_case")]
pub enum ProjectionState {
    Document(CrdtDocument),
    Entity(Entity),
}

/// One document or entity plus the local log position it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub entity_id: EntityId,
    pub entity_type: String,
    pub state: ProjectionState,
    /// Highest local WAL offset applied.
    pub covered_offset: u64,
}

/// Effect of applying a remote operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RemoteEffect {
    Applied,
    Unchanged,
    Rejected(ConflictRecord),
    /// The remote write replaced a local first-write-wins write.
    Displaced(ConflictRecord),
    AwaitingUser(ConflictRecord),
}

impl Projection {
    /// An empty projection shaped by the schema.
    pub fn new(entity_id: EntityId, schema: &EntitySchema) -> Self {
        let state = match schema.crdt_kind() {
            Some(kind) => ProjectionState::Document(CrdtDocument::new(kind)),
            None => ProjectionState::Entity(Entity::new(entity_id, schema.entity_type.clone())),
        };
        Self {
            entity_id,
            entity_type: schema.entity_type.clone(),
            state,
            covered_offset: 0,
        }
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> SyncResult<Self> {
        Ok(Self {
            entity_id: snapshot.entity_id,
            entity_type: snapshot.entity_type.clone(),
            state: serde_json::from_value(snapshot.state.clone())?,
            covered_offset: snapshot.covered_offset,
        })
    }

    pub fn to_snapshot(&self) -> SyncResult<Snapshot> {
        Ok(Snapshot {
            entity_id: self.entity_id,
            entity_type: self.entity_type.clone(),
            state: serde_json::to_value(&self.state)?,
            covered_offset: self.covered_offset,
        })
    }

    #[must_use]
    pub fn document(&self) -> Option<&CrdtDocument> {
        match &self.state {
            ProjectionState::Document(doc) => Some(doc),
            ProjectionState::Entity(_) => None,
        }
    }

    #[must_use]
    pub fn entity(&self) -> Option<&Entity> {
        match &self.state {
            ProjectionState::Entity(entity) => Some(entity),
            ProjectionState::Document(_) => None,
        }
    }

    /// Applies an operation this replica originated.
    ///
    /// Local writes were planned against this very state, so a field write
    /// always takes over the field.
    pub fn apply_local(&mut self, op: &Operation) -> SyncResult<()> {
        match (&mut self.state, &op.payload) {
            (ProjectionState::Document(doc), _) => {
                doc.apply(op)?;
            }
            (
                ProjectionState::Entity(entity),
                OperationPayload::FieldSet {
                    field,
                    value,
                    base_version,
                },
            ) => {
                entity.observe_update(&op.timestamp);
                let mut state = FieldState::new(value.clone(), op.stamp(), op.timestamp.clone());
                state.version = base_version + 1;
                state.base_version = *base_version;
                entity.put_field(field.clone(), state);
            }
            (ProjectionState::Entity(entity), OperationPayload::EntityDelete) => {
                entity.observe_delete(&op.timestamp);
            }
            (ProjectionState::Entity(_), payload) => {
                return Err(SyncError::StrategyMismatch {
                    entity_type: self.entity_type.clone(),
                    strategy: "plain entity",
                    operation: payload.kind(),
                });
            }
        }
        self.covered_offset = self.covered_offset.max(op.wal_offset);
        Ok(())
    }

    /// Applies an operation pulled from the remote.
    ///
    /// With `presenter_attached == false`, `UserChoice` conflicts are settled
    /// immediately under the resolver's fallback strategy.
    pub(crate) fn apply_remote(
        &mut self,
        op: &Operation,
        schema: &EntitySchema,
        resolver: &ConflictResolver,
        presenter_attached: bool,
    ) -> SyncResult<RemoteEffect> {
        let entity = match &mut self.state {
            ProjectionState::Document(doc) => {
                return Ok(if doc.apply(op)? {
                    RemoteEffect::Applied
                } else {
                    RemoteEffect::Unchanged
                });
            }
            ProjectionState::Entity(entity) => entity,
        };

        let write = match &op.payload {
            OperationPayload::EntityDelete => {
                entity.observe_delete(&op.timestamp);
                return Ok(RemoteEffect::Applied);
            }
            payload => FieldWrite::from_operation(op).ok_or_else(|| SyncError::StrategyMismatch {
                entity_type: schema.entity_type.clone(),
                strategy: schema.strategy.name(),
                operation: payload.kind(),
            })?,
        };

        let local = entity.field(&write.field).cloned();
        let local = local.as_ref();
        let mut resolution = resolver.resolve(local, &write, &schema.strategy)?;
        if let Resolution::Deferred(record) = &resolution {
            if !presenter_attached {
                warn!(
                    "No conflict presenter attached; settling {}/{} with {}",
                    record.entity_id,
                    record.field,
                    resolver.fallback().name()
                );
                resolution = resolver.resolve(local, &write, resolver.fallback())?;
            }
        }
        entity.observe_update(&write.clock);

        let mut effect = RemoteEffect::Applied;
        let next = match resolution {
            Resolution::KeepLocal => return Ok(RemoteEffect::Unchanged),
            Resolution::Rejected(record) => return Ok(RemoteEffect::Rejected(record)),
            Resolution::Deferred(record) => return Ok(RemoteEffect::AwaitingUser(record)),
            Resolution::TakeRemote => taken_over(local, &write),
            Resolution::Displaced(record) => {
                effect = RemoteEffect::Displaced(record);
                taken_over(local, &write)
            }
            Resolution::Merged(value) => {
                let mut next = write.as_state();
                if let Some(local) = local {
                    next = FieldState::new(
                        value,
                        local.stamp().max(write.stamp),
                        local.clock.merged(&write.clock),
                    );
                    next.version = local.version.max(write.base_version + 1);
                    next.base_version = local.base_version.max(write.base_version);
                }
                next
            }
        };
        debug!(entity = %write.entity_id, field = %write.field, writer = %write.stamp.id, "field updated from remote");
        entity.put_field(write.field, next);
        Ok(effect)
    }
}

/// The field state after `write` replaces `local`. The version only moves
/// when the write was based on the current one.
fn taken_over(local: Option<&FieldState>, write: &FieldWrite) -> FieldState {
    let mut next = write.as_state();
    if let Some(local) = local {
        next.version = if write.base_version == local.version {
            local.version + 1
        } else {
            local.version
        };
    }
    next
}
