//! Conflict resolution for plain entity fields.
//!
//! CRDT documents never reach the resolver; they merge natively. Every
//! other entity type names a [`ConflictStrategy`], and each incoming field
//! write is resolved against the local field state under that strategy.
//!
//! All outcomes except `LocalWins` and `UserChoice` are pure functions of the
//! two writes, so replicas that see the same writes converge regardless of
//! arrival order.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tandem_model::{ConflictStrategy, FieldRule, FieldState, MergeHandler};
use tandem_types::{CausalOrder, EntityId, Operation, OperationPayload, Stamp, VectorClock};

/// An incoming write to one field, extracted from a `FieldSet` operation.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub entity_id: EntityId,
    pub entity_type: String,
    pub field: String,
    pub value: serde_json::Value,
    pub stamp: Stamp,
    pub clock: VectorClock,
    pub base_version: u64,
}

impl FieldWrite {
    /// Extracts the write carried by `op`, if it is a field write.
    #[must_use]
    pub fn from_operation(op: &Operation) -> Option<Self> {
        match &op.payload {
            OperationPayload::FieldSet {
                field,
                value,
                base_version,
            } => Some(Self {
                entity_id: op.entity_id,
                entity_type: op.entity_type.clone(),
                field: field.clone(),
                value: value.clone(),
                stamp: op.stamp(),
                clock: op.timestamp.clone(),
                base_version: *base_version,
            }),
            _ => None,
        }
    }

    /// The write as a field state, for merge handlers.
    #[must_use]
    pub fn as_state(&self) -> FieldState {
        let mut state = FieldState::new(self.value.clone(), self.stamp, self.clock.clone());
        state.base_version = self.base_version;
        state.version = self.base_version + 1;
        state
    }
}

/// Both sides of a conflict that was not resolved automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity_id: EntityId,
    pub entity_type: String,
    pub field: String,
    pub local_value: serde_json::Value,
    pub remote_value: serde_json::Value,
    pub local_timestamp: VectorClock,
    pub remote_timestamp: VectorClock,
    pub local_stamp: Stamp,
    pub remote_stamp: Stamp,
}

impl ConflictRecord {
    fn new(local: &FieldState, remote: &FieldWrite) -> Self {
        Self {
            entity_id: remote.entity_id,
            entity_type: remote.entity_type.clone(),
            field: remote.field.clone(),
            local_value: local.value().clone(),
            remote_value: remote.value.clone(),
            local_timestamp: local.clock.clone(),
            remote_timestamp: remote.clock.clone(),
            local_stamp: local.stamp(),
            remote_stamp: remote.stamp,
        }
    }
}

/// What to do with an incoming field write.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The local value stands.
    KeepLocal,
    /// The remote write replaces the local value.
    TakeRemote,
    /// Both writes are folded into a new value.
    Merged(serde_json::Value),
    /// The remote write lost an optimistic-lock race and is dropped.
    Rejected(ConflictRecord),
    /// The remote write won an optimistic-lock race against the local write
    /// and replaces it. The record names the local value that was lost.
    Displaced(ConflictRecord),
    /// The local value stands until the user picks one.
    Deferred(ConflictRecord),
}

/// Resolves field writes; owns the named merge handlers.
pub struct ConflictResolver {
    handlers: HashMap<String, Arc<dyn MergeHandler>>,
    fallback: ConflictStrategy,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl ConflictResolver {
    /// Creates a resolver. `fallback` is used for `UserChoice` conflicts when
    /// no conflict UI is attached.
    #[must_use]
    pub fn new(fallback: ConflictStrategy) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
        }
    }

    /// Registers a handler for `FieldRule::Custom { handler: name }`.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn MergeHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    #[must_use]
    pub fn fallback(&self) -> &ConflictStrategy {
        &self.fallback
    }

    /// Resolves `remote` against the local state of the same field.
    ///
    /// Errors only when the strategy cannot govern plain fields at all or a
    /// custom handler is not registered.
    pub fn resolve(
        &self,
        local: Option<&FieldState>,
        remote: &FieldWrite,
        strategy: &ConflictStrategy,
    ) -> SyncResult<Resolution> {
        if let ConflictStrategy::CrdtNative { .. } = strategy {
            return Err(not_a_field(remote, strategy));
        }
        let Some(local) = local else {
            return Ok(Resolution::TakeRemote);
        };
        if local.stamp() == remote.stamp {
            return Ok(Resolution::KeepLocal);
        }

        match strategy {
            ConflictStrategy::LastWriteWins => Ok(by_stamp(local, remote)),
            ConflictStrategy::FirstWriteWins => Ok(first_write(local, remote)),
            ConflictStrategy::FieldMerge { fields } => {
                if let Some(ordered) = causal(local, remote) {
                    return Ok(ordered);
                }
                self.apply_rule(fields.rule_for(&remote.field), local, remote)
            }
            ConflictStrategy::UserChoice => Ok(causal(local, remote)
                .unwrap_or_else(|| Resolution::Deferred(ConflictRecord::new(local, remote)))),
            ConflictStrategy::CrdtNative { .. } => Err(not_a_field(remote, strategy)),
        }
    }

    /// Settles a deferred conflict under the fallback strategy, returning the
    /// value that should win.
    pub fn settle(&self, record: &ConflictRecord) -> SyncResult<serde_json::Value> {
        let local = FieldState::new(
            record.local_value.clone(),
            record.local_stamp,
            record.local_timestamp.clone(),
        );
        let remote = FieldWrite {
            entity_id: record.entity_id,
            entity_type: record.entity_type.clone(),
            field: record.field.clone(),
            value: record.remote_value.clone(),
            stamp: record.remote_stamp,
            clock: record.remote_timestamp.clone(),
            base_version: local.version,
        };
        Ok(match self.resolve(Some(&local), &remote, &self.fallback)? {
            Resolution::TakeRemote | Resolution::Displaced(_) => record.remote_value.clone(),
            Resolution::Merged(value) => value,
            _ => record.local_value.clone(),
        })
    }

    fn apply_rule(
        &self,
        rule: &FieldRule,
        local: &FieldState,
        remote: &FieldWrite,
    ) -> SyncResult<Resolution> {
        Ok(match rule {
            FieldRule::RemoteWins => Resolution::TakeRemote,
            FieldRule::LocalWins => Resolution::KeepLocal,
            FieldRule::MostRecent => by_stamp(local, remote),
            FieldRule::Union => match union(local.value(), &remote.value) {
                Some(value) => Resolution::Merged(value),
                None => by_stamp(local, remote),
            },
            FieldRule::Custom { handler } => {
                let handler = self.handlers.get(handler).ok_or_else(|| {
                    SyncError::Config(format!("merge handler {handler} is not registered"))
                })?;
                Resolution::Merged(handler.merge(&remote.field, local, &remote.as_state()))
            }
        })
    }
}

fn not_a_field(remote: &FieldWrite, strategy: &ConflictStrategy) -> SyncError {
    SyncError::StrategyMismatch {
        entity_type: remote.entity_type.clone(),
        strategy: strategy.name(),
        operation: "field_set",
    }
}

fn by_stamp(local: &FieldState, remote: &FieldWrite) -> Resolution {
    if remote.stamp > local.stamp() {
        Resolution::TakeRemote
    } else {
        Resolution::KeepLocal
    }
}

/// Optimistic lock. A write based on the current version is accepted. Two
/// writes based on the same version race, and the smaller stamp is the first
/// write; a local write that loses it is displaced, not silently replaced.
/// Anything else is stale.
fn first_write(local: &FieldState, remote: &FieldWrite) -> Resolution {
    if remote.base_version == local.version {
        Resolution::TakeRemote
    } else if remote.base_version == local.base_version {
        if remote.stamp < local.stamp() {
            Resolution::Displaced(ConflictRecord::new(local, remote))
        } else {
            Resolution::Rejected(ConflictRecord::new(local, remote))
        }
    } else {
        Resolution::Rejected(ConflictRecord::new(local, remote))
    }
}

/// Resolves causally ordered writes; `None` when they are concurrent.
fn causal(local: &FieldState, remote: &FieldWrite) -> Option<Resolution> {
    match remote.clock.compare(&local.clock) {
        CausalOrder::After => Some(Resolution::TakeRemote),
        CausalOrder::Before | CausalOrder::Equal => Some(Resolution::KeepLocal),
        CausalOrder::Concurrent => None,
    }
}

/// Union of two JSON arrays, deduplicated and ordered by serialized form so
/// both sides produce the same array.
fn union(a: &serde_json::Value, b: &serde_json::Value) -> Option<serde_json::Value> {
    let (a, b) = (a.as_array()?, b.as_array()?);
    let mut keyed: Vec<(String, serde_json::Value)> = a
        .iter()
        .chain(b.iter())
        .map(|v| (v.to_string(), v.clone()))
        .collect();
    keyed.sort_by(|x, y| x.0.cmp(&y.0));
    keyed.dedup_by(|x, y| x.0 == y.0);
    Some(serde_json::Value::Array(
        keyed.into_iter().map(|(_, v)| v).collect(),
    ))
}
