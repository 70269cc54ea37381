//! A CRDT document: one of the supported value types plus its lifecycle.
//!
//! Documents are projections. They are rebuilt from snapshots and the
//! operation log, so everything here is pure and in-memory.

use crate::{CrdtError, CrdtResult, GCounter, LwwElementSet, PNCounter, Rga};
use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_types::{Operation, OperationPayload};

/// Which CRDT backs a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrdtKind {
    GCounter,
    PnCounter,
    LwwSet,
    Text,
}

impl fmt::Display for CrdtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GCounter => "g_counter",
            Self::PnCounter => "pn_counter",
            Self::LwwSet => "lww_set",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

/// Lifecycle shared by all document types. There is no terminal state:
/// a document is always mergeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    #[default]
    Uninitialized,
    Active,
}

/// The state of the backing CRDT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum CrdtState {
    GCounter(GCounter),
    PnCounter(PNCounter),
    LwwSet(LwwElementSet<String>),
    Text(Rga<char>),
}

/// Materialized value of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentValue {
    Counter(i64),
    Set(Vec<String>),
    Text(String),
}

/// A replicated document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtDocument {
    state: DocumentState,
    crdt: CrdtState,
}

impl CrdtDocument {
    /// Creates an uninitialized document of the given kind.
    #[must_use]
    pub fn new(kind: CrdtKind) -> Self {
        let crdt = match kind {
            CrdtKind::GCounter => CrdtState::GCounter(GCounter::new()),
            CrdtKind::PnCounter => CrdtState::PnCounter(PNCounter::new()),
            CrdtKind::LwwSet => CrdtState::LwwSet(LwwElementSet::new()),
            CrdtKind::Text => CrdtState::Text(Rga::new()),
        };
        Self {
            state: DocumentState::Uninitialized,
            crdt,
        }
    }

    #[must_use]
    pub fn kind(&self) -> CrdtKind {
        match self.crdt {
            CrdtState::GCounter(_) => CrdtKind::GCounter,
            CrdtState::PnCounter(_) => CrdtKind::PnCounter,
            CrdtState::LwwSet(_) => CrdtKind::LwwSet,
            CrdtState::Text(_) => CrdtKind::Text,
        }
    }

    #[must_use]
    pub fn state(&self) -> DocumentState {
        self.state
    }

    /// Read access to the backing CRDT.
    #[must_use]
    pub fn crdt(&self) -> &CrdtState {
        &self.crdt
    }

    /// Applies a replicated operation. Returns true if the state changed.
    ///
    /// Every accepted payload is idempotent, so duplicates return false.
    pub fn apply(&mut self, op: &Operation) -> CrdtResult<bool> {
        let kind = self.kind();
        let origin = op.origin();
        let changed = match (&mut self.crdt, &op.payload) {
            (
                CrdtState::GCounter(counter),
                OperationPayload::Counter {
                    positive, negative, ..
                },
            ) => {
                if *negative > 0 {
                    return Err(CrdtError::Unsupported(format!(
                        "grow-only counter cannot apply decrement from {}",
                        op.id
                    )));
                }
                counter.observe(origin, *positive)
            }
            (
                CrdtState::PnCounter(counter),
                OperationPayload::Counter {
                    positive, negative, ..
                },
            ) => counter.observe(origin, *positive, *negative),
            (CrdtState::LwwSet(set), OperationPayload::SetAdd { element }) => {
                set.add(element.clone(), op.stamp())
            }
            (CrdtState::LwwSet(set), OperationPayload::SetRemove { element }) => {
                set.remove(element.clone(), op.stamp())
            }
            (CrdtState::Text(text), OperationPayload::TextInsert { origin, chars }) => {
                text.apply_insert(*origin, chars)
            }
            (CrdtState::Text(text), OperationPayload::TextDelete { ids }) => {
                let mut changed = false;
                for id in ids {
                    changed |= text.delete_by_id(*id);
                }
                changed
            }
            (_, payload) => {
                return Err(CrdtError::KindMismatch {
                    kind,
                    payload: payload.kind(),
                })
            }
        };
        self.state = DocumentState::Active;
        Ok(changed)
    }

    /// Merges another replica's state of the same document.
    pub fn merge(&mut self, other: &Self) -> CrdtResult<()> {
        match (&mut self.crdt, &other.crdt) {
            (CrdtState::GCounter(a), CrdtState::GCounter(b)) => a.merge(b),
            (CrdtState::PnCounter(a), CrdtState::PnCounter(b)) => a.merge(b),
            (CrdtState::LwwSet(a), CrdtState::LwwSet(b)) => a.merge(b),
            (CrdtState::Text(a), CrdtState::Text(b)) => a.merge(b),
            _ => {
                return Err(CrdtError::MergeMismatch {
                    local: self.kind(),
                    remote: other.kind(),
                })
            }
        }
        if other.state == DocumentState::Active {
            self.state = DocumentState::Active;
        }
        Ok(())
    }

    pub fn merged(&self, other: &Self) -> CrdtResult<Self> {
        let mut result = self.clone();
        result.merge(other)?;
        Ok(result)
    }

    /// The materialized projection.
    #[must_use]
    pub fn value(&self) -> DocumentValue {
        match &self.crdt {
            CrdtState::GCounter(c) => {
                DocumentValue::Counter(i64::try_from(c.value()).unwrap_or(i64::MAX))
            }
            CrdtState::PnCounter(c) => DocumentValue::Counter(c.value()),
            CrdtState::LwwSet(s) => DocumentValue::Set(s.iter().cloned().collect()),
            CrdtState::Text(t) => DocumentValue::Text(t.as_string()),
        }
    }
}
