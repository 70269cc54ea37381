use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_crdt::CrdtKind;

/// Declares how one entity type replicates.
///
/// Every entity type is declared explicitly; the engine never infers a
/// strategy from field contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity_type: String,
    pub strategy: ConflictStrategy,
    #[serde(default)]
    pub delete_policy: DeletePolicy,
}

impl EntitySchema {
    pub fn new(entity_type: impl Into<String>, strategy: ConflictStrategy) -> Self {
        Self {
            entity_type: entity_type.into(),
            strategy,
            delete_policy: DeletePolicy::default(),
        }
    }

    /// Shorthand for a type whose documents are CRDTs.
    pub fn crdt(entity_type: impl Into<String>, kind: CrdtKind) -> Self {
        Self::new(entity_type, ConflictStrategy::CrdtNative { crdt: kind })
    }

    #[must_use]
    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// The CRDT backing this type, if it is CRDT-native.
    #[must_use]
    pub fn crdt_kind(&self) -> Option<CrdtKind> {
        match &self.strategy {
            ConflictStrategy::CrdtNative { crdt } => Some(*crdt),
            _ => None,
        }
    }
}

/// How concurrent writes to a plain field are resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Highest stamp wins; ties are impossible because stamps are unique.
    LastWriteWins,
    /// Optimistic concurrency: a write must name the version it was based on.
    FirstWriteWins,
    /// Per-field rules.
    FieldMerge { fields: FieldMergeTable },
    /// The entity is a CRDT document and merges natively.
    CrdtNative { crdt: CrdtKind },
    /// Concurrent writes are handed to the user.
    UserChoice,
}

impl ConflictStrategy {
    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "last_write_wins",
            Self::FirstWriteWins => "first_write_wins",
            Self::FieldMerge { .. } => "field_merge",
            Self::CrdtNative { .. } => "crdt_native",
            Self::UserChoice => "user_choice",
        }
    }
}

/// Per-field rule table for [`ConflictStrategy::FieldMerge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMergeTable {
    #[serde(default)]
    pub rules: BTreeMap<String, FieldRule>,
    /// Rule for fields not listed.
    #[serde(default)]
    pub default_rule: FieldRule,
}

impl FieldMergeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.rules.insert(field.into(), rule);
        self
    }

    #[must_use]
    pub fn rule_for(&self, field: &str) -> &FieldRule {
        self.rules.get(field).unwrap_or(&self.default_rule)
    }
}

/// Merge rule for one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRule {
    /// Server-authoritative: the pulled value always replaces the local one.
    /// Meant for device ↔ server topologies, where only the server's writes
    /// are pulled.
    RemoteWins,
    /// The local value is kept against concurrent remote writes.
    LocalWins,
    /// Highest stamp wins.
    #[default]
    MostRecent,
    /// Set-like JSON arrays: the union of both sides.
    Union,
    /// A registered merge handler decides.
    Custom { handler: String },
}

/// Outcome of a delete concurrent with an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// The entity survives unless the delete observed every update.
    #[default]
    UpdateWins,
    /// The entity stays deleted unless an update observed the delete.
    DeleteWins,
}
