//! Operations: the unit of local durability and of replication.
//!
//! An operation is created once, stamped by the causality tracker, appended
//! to the write-ahead log and never mutated afterwards. Every replica that
//! receives it must be able to apply it without any further context.

use crate::{CharId, EntityId, OperationId, ReplicaId, Stamp, VectorClock};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The mutation carried by an operation.
///
/// Counter payloads carry the originating replica's cumulative totals rather
/// than a bare delta, so applying the same operation twice is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum OperationPayload {
    /// Counter change. `positive`/`negative` are the origin's slot totals
    /// after the change; `delta` is informational.
    Counter {
        delta: i64,
        positive: u64,
        negative: u64,
    },

    /// Add an element to a last-writer-wins element set.
    SetAdd { element: String },

    /// Remove an element from a last-writer-wins element set.
    SetRemove { element: String },

    /// Insert a run of characters. The first is anchored after `origin`,
    /// each following one after its predecessor.
    TextInsert {
        origin: CharId,
        chars: Vec<(CharId, char)>,
    },

    /// Tombstone characters.
    TextDelete { ids: Vec<CharId> },

    /// Write a plain (non-CRDT) field of an entity.
    FieldSet {
        field: String,
        value: serde_json::Value,
        /// Field version the writer observed; only checked under
        /// first-write-wins.
        #[serde(default)]
        base_version: u64,
    },

    /// Delete a plain entity.
    EntityDelete,
}

impl OperationPayload {
    /// Short, stable name of the payload kind (used in logs and errors).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Counter { .. } => "counter",
            Self::SetAdd { .. } => "set_add",
            Self::SetRemove { .. } => "set_remove",
            Self::TextInsert { .. } => "text_insert",
            Self::TextDelete { .. } => "text_delete",
            Self::FieldSet { .. } => "field_set",
            Self::EntityDelete => "entity_delete",
        }
    }

    /// True for payloads that target a plain entity rather than a CRDT.
    #[must_use]
    pub fn is_entity_write(&self) -> bool {
        matches!(self, Self::FieldSet { .. } | Self::EntityDelete)
    }
}

impl fmt::Display for OperationPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// An immutable, causally stamped mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// `(replica, sequence)` of the originating write.
    pub id: OperationId,

    /// Declared entity type; selects the conflict strategy.
    pub entity_type: String,

    /// The document or entity this operation targets.
    pub entity_id: EntityId,

    pub payload: OperationPayload,

    /// Vector clock of the origin right after its tick.
    pub timestamp: VectorClock,

    /// Position in the origin's write-ahead log; 0 until appended.
    #[serde(default)]
    pub wal_offset: u64,
}

impl Operation {
    /// Creates an operation that has not been appended yet.
    #[must_use]
    pub fn new(
        id: OperationId,
        entity_type: impl Into<String>,
        entity_id: EntityId,
        payload: OperationPayload,
        timestamp: VectorClock,
    ) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
            entity_id,
            payload,
            timestamp,
            wal_offset: 0,
        }
    }

    /// The replica that created this operation.
    #[must_use]
    pub fn origin(&self) -> ReplicaId {
        self.id.replica
    }

    /// Total-order stamp used for last-writer-wins decisions.
    #[must_use]
    pub fn stamp(&self) -> Stamp {
        Stamp::new(&self.timestamp, self.id)
    }

    /// Checks the structural invariants a well-formed operation satisfies:
    /// the origin's own clock entry equals the sequence and is non-zero.
    ///
    /// Returns a description of the first violation found.
    pub fn check_well_formed(&self) -> Result<(), String> {
        if self.id.sequence == 0 {
            return Err(format!("operation {} has sequence 0", self.id));
        }
        let own = self.timestamp.get(&self.id.replica);
        if own != self.id.sequence {
            return Err(format!(
                "operation {} carries origin clock entry {own}, expected {}",
                self.id, self.id.sequence
            ));
        }
        if let OperationPayload::TextInsert { chars, .. } = &self.payload {
            if chars.is_empty() {
                return Err(format!("operation {} inserts no characters", self.id));
            }
            if chars.iter().any(|(id, _)| id.is_root() || id.replica != self.id.replica) {
                return Err(format!(
                    "operation {} inserts characters not owned by its origin",
                    self.id
                ));
            }
        }
        Ok(())
    }
}
