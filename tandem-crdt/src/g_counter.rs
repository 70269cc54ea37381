//! Grow-only counter.
//!
//! Each replica owns one slot and only ever raises it. The value is the sum
//! of all slots and merge is the per-replica maximum. Suited to likes or
//! view counts, never to quantities that must go down.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_types::ReplicaId;

/// A G-Counter CRDT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    slots: BTreeMap<ReplicaId, u64>,
}

impl GCounter {
    /// Creates a counter with value 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to the replica's own slot and returns the new slot total.
    pub fn increment(&mut self, replica: ReplicaId, amount: u64) -> u64 {
        let total = self.slot(&replica).saturating_add(amount);
        self.observe(replica, total);
        total
    }

    /// Raises a replica's slot to `total` if it is larger.
    ///
    /// This is how replicated increments are applied: re-observing the same
    /// total is a no-op, so duplicates are harmless.
    pub fn observe(&mut self, replica: ReplicaId, total: u64) -> bool {
        if total == 0 {
            return false;
        }
        let slot = self.slots.entry(replica).or_insert(0);
        if total > *slot {
            *slot = total;
            true
        } else {
            false
        }
    }

    /// The replica's current slot (0 if it never incremented).
    #[must_use]
    pub fn slot(&self, replica: &ReplicaId) -> u64 {
        self.slots.get(replica).copied().unwrap_or(0)
    }

    /// Sum of all slots.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.slots.values().fold(0u64, |acc, n| acc.saturating_add(*n))
    }

    /// Merges another counter into this one (per-replica max).
    pub fn merge(&mut self, other: &Self) {
        for (&replica, &count) in &other.slots {
            self.observe(replica, count);
        }
    }

    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}
