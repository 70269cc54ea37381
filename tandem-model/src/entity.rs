use crate::DeletePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_crdt::LwwRegister;
use tandem_types::{CausalOrder, EntityId, OperationId, Stamp, VectorClock};

/// The accepted write of one plain field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    pub register: LwwRegister<serde_json::Value>,
    /// Clock of the write (or the join of clocks when values were merged).
    pub clock: VectorClock,
    /// Number of accepted writes under first-write-wins.
    pub version: u64,
    /// Version the current value was written against.
    pub base_version: u64,
}

impl FieldState {
    pub fn new(value: serde_json::Value, stamp: Stamp, clock: VectorClock) -> Self {
        Self {
            register: LwwRegister::new(value, stamp),
            clock,
            version: 1,
            base_version: 0,
        }
    }

    #[must_use]
    pub fn value(&self) -> &serde_json::Value {
        self.register.value()
    }

    #[must_use]
    pub fn stamp(&self) -> Stamp {
        self.register.stamp()
    }

    /// The operation that wrote the current value.
    #[must_use]
    pub fn writer(&self) -> OperationId {
        self.register.stamp().id
    }
}

/// A plain (non-CRDT) entity projected from field writes and deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: String,
    pub fields: BTreeMap<String, FieldState>,
    /// Join of the clocks of every field write seen.
    pub updates: VectorClock,
    /// Join of the clocks of every delete seen.
    pub deletes: Option<VectorClock>,
}

impl Entity {
    pub fn new(id: EntityId, entity_type: impl Into<String>) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
            updates: VectorClock::new(),
            deletes: None,
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldState> {
        self.fields.get(name)
    }

    /// Current version of a field; 0 if never written.
    #[must_use]
    pub fn version(&self, name: &str) -> u64 {
        self.fields.get(name).map_or(0, |f| f.version)
    }

    pub fn put_field(&mut self, name: impl Into<String>, state: FieldState) {
        self.fields.insert(name.into(), state);
    }

    /// Records a field write, accepted or not, for delete resolution.
    pub fn observe_update(&mut self, clock: &VectorClock) {
        self.updates.merge(clock);
    }

    pub fn observe_delete(&mut self, clock: &VectorClock) {
        match &mut self.deletes {
            Some(deletes) => deletes.merge(clock),
            None => self.deletes = Some(clock.clone()),
        }
    }

    /// Whether the entity exists under the given delete policy.
    ///
    /// Computed from joined clocks only, so every replica that has seen the
    /// same writes and deletes agrees regardless of arrival order.
    #[must_use]
    pub fn is_alive(&self, policy: DeletePolicy) -> bool {
        let Some(deletes) = &self.deletes else {
            return !self.fields.is_empty();
        };
        match policy {
            DeletePolicy::UpdateWins => !matches!(
                self.updates.compare(deletes),
                CausalOrder::Before | CausalOrder::Equal
            ),
            DeletePolicy::DeleteWins => self.updates.compare(deletes) == CausalOrder::After,
        }
    }

    /// Field values as a JSON object.
    #[must_use]
    pub fn data(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(name, state)| (name.clone(), state.value().clone()))
                .collect(),
        )
    }

    /// Extract a string value using a JSON pointer (e.g., "/title").
    pub fn get_str(&self, pointer: &str) -> Option<String> {
        self.data().pointer(pointer).and_then(|v| v.as_str().map(str::to_owned))
    }

    /// Extract a numeric value using a JSON pointer.
    pub fn get_number(&self, pointer: &str) -> Option<f64> {
        self.data().pointer(pointer).and_then(serde_json::Value::as_f64)
    }

    /// Extract a boolean value using a JSON pointer.
    pub fn get_bool(&self, pointer: &str) -> Option<bool> {
        self.data().pointer(pointer).and_then(serde_json::Value::as_bool)
    }
}
