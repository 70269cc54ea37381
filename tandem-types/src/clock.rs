//! Vector clock timestamps and the causality-consistent `Stamp` order.
//!
//! A vector clock maps each replica to a logical counter. Comparing two
//! clocks yields a partial order (happened-before); `Stamp` extends it to a
//! total order for last-writer-wins decisions.

use crate::{OperationId, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causality relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// First clock happened before second.
    Before,
    /// First clock happened after second.
    After,
    /// Clocks are concurrent (neither happened before the other).
    Concurrent,
    /// Clocks are identical.
    Equal,
}

/// A vector clock (the core's logical timestamp).
///
/// Missing entries are an implicit zero, so clocks with different key sets
/// compare as if the absent replicas had never written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// Creates a new empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a clock from explicit entries. Zero entries are dropped.
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = (ReplicaId, u64)>) -> Self {
        let mut clock = Self::new();
        for (replica, time) in entries {
            clock.update(replica, time);
        }
        clock
    }

    /// Returns the logical time for a replica (0 if not present).
    #[must_use]
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Returns all replicas and their times in replica order.
    pub fn entries(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.clocks.iter()
    }

    /// Returns the number of replicas with a non-zero entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Sum of all entries. Strictly grows along every happened-before chain.
    #[must_use]
    pub fn weight(&self) -> u64 {
        self.clocks.values().fold(0u64, |acc, t| acc.saturating_add(*t))
    }

    /// Increments the entry for a replica and returns the new time.
    pub fn increment(&mut self, replica: ReplicaId) -> u64 {
        let entry = self.clocks.entry(replica).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    /// Raises the entry for a replica to `time`. Never lowers it.
    pub fn update(&mut self, replica: ReplicaId, time: u64) {
        if time == 0 {
            return;
        }
        let entry = self.clocks.entry(replica).or_insert(0);
        if time > *entry {
            *entry = time;
        }
    }

    /// Merges another clock into this one by taking the per-replica maximum.
    ///
    /// Commutative, associative and idempotent.
    pub fn merge(&mut self, other: &Self) {
        for (replica, &time) in &other.clocks {
            self.update(*replica, time);
        }
    }

    /// Creates a new clock that is the merge of this and another.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compares this clock with another to determine causal ordering.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let mut self_ge = true;
        let mut other_ge = true;

        for replica in self.clocks.keys().chain(other.clocks.keys()) {
            let mine = self.get(replica);
            let theirs = other.get(replica);
            if mine < theirs {
                self_ge = false;
            }
            if theirs < mine {
                other_ge = false;
            }
            if !self_ge && !other_ge {
                break;
            }
        }

        match (self_ge, other_ge) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// True iff every entry of `self` is <= the matching entry of `other`
    /// and at least one is strictly less.
    #[must_use]
    pub fn happens_before(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    /// True iff neither clock happened before the other and they differ.
    #[must_use]
    pub fn concurrent(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// True iff this clock is >= the other for every replica.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(self.compare(other), CausalOrder::After | CausalOrder::Equal)
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Equal
    }
}

impl Eq for VectorClock {}

/// Total order over operations that respects causality.
///
/// Ordered by clock weight, then by operation ID (replica, then sequence).
/// If `a` happened before `b` its weight is strictly smaller, so the stamp
/// never contradicts the causal order; concurrent writes fall back to the
/// replica ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub weight: u64,
    pub id: OperationId,
}

impl Stamp {
    #[must_use]
    pub fn new(clock: &VectorClock, id: OperationId) -> Self {
        Self {
            weight: clock.weight(),
            id,
        }
    }

    /// The smallest possible stamp; loses to every real write.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            weight: 0,
            id: OperationId::new(ReplicaId::from_uuid(uuid::Uuid::nil()), 0),
        }
    }

    #[must_use]
    pub fn replica(&self) -> ReplicaId {
        self.id.replica
    }
}

impl Default for Stamp {
    fn default() -> Self {
        Self::zero()
    }
}

