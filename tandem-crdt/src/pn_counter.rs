//! Positive-Negative Counter CRDT.
//!
//! A PN-Counter supports both increment and decrement across replicas. It
//! is a pair of grow-only counters; the value is `positive - negative`.
//!
//! Satisfies commutativity, associativity, and idempotency for merge.

use crate::GCounter;
use serde::{Deserialize, Serialize};
use tandem_types::ReplicaId;

/// A Positive-Negative Counter CRDT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PNCounter {
    positive: GCounter,
    negative: GCounter,
}

impl PNCounter {
    /// Creates a new counter with value 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter by `amount` for the given replica.
    pub fn increment(&mut self, replica: ReplicaId, amount: u64) {
        self.positive.increment(replica, amount);
    }

    /// Decrements the counter by `amount` for the given replica.
    pub fn decrement(&mut self, replica: ReplicaId, amount: u64) {
        self.negative.increment(replica, amount);
    }

    /// Raises the replica's positive and negative slots to the given
    /// totals. Returns true if either slot moved.
    pub fn observe(&mut self, replica: ReplicaId, positive: u64, negative: u64) -> bool {
        let p = self.positive.observe(replica, positive);
        let n = self.negative.observe(replica, negative);
        p || n
    }

    /// The replica's `(positive, negative)` slot totals.
    #[must_use]
    pub fn slots(&self, replica: &ReplicaId) -> (u64, u64) {
        (self.positive.slot(replica), self.negative.slot(replica))
    }

    /// Returns the current counter value (may be negative), saturating at
    /// the bounds of `i64`.
    #[must_use]
    pub fn value(&self) -> i64 {
        let net = i128::from(self.positive.value()) - i128::from(self.negative.value());
        i64::try_from(net).unwrap_or(if net < 0 { i64::MIN } else { i64::MAX })
    }

    /// Merges another PNCounter into this one (per-replica max on both halves).
    pub fn merge(&mut self, other: &Self) {
        self.positive.merge(&other.positive);
        self.negative.merge(&other.negative);
    }

    /// Returns a new counter that is the merge of this and another.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}
