//! Causality tracker: the per-replica vector clock.
//!
//! Every locally originated operation is stamped with exactly one `tick()`,
//! and every remote timestamp observed is folded in with `merge()`. The
//! tracker never lets any entry go backwards.

use tandem_types::{EntityId, Operation, OperationId, OperationPayload, ReplicaId, VectorClock};
use tracing::trace;

/// Owns the vector clock of one replica.
///
/// Injected into whatever component creates operations for that replica;
/// there is no process-wide clock.
#[derive(Debug, Clone)]
pub struct CausalityTracker {
    replica: ReplicaId,
    clock: VectorClock,
}

impl CausalityTracker {
    /// Creates a tracker with an empty clock.
    #[must_use]
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: VectorClock::new(),
        }
    }

    /// Creates a tracker resuming from a previously persisted clock.
    #[must_use]
    pub fn with_clock(replica: ReplicaId, clock: VectorClock) -> Self {
        Self { replica, clock }
    }

    #[must_use]
    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    /// The current clock.
    #[must_use]
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Local sequence: this replica's own clock entry.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.clock.get(&self.replica)
    }

    /// Advances the local entry and returns the new timestamp.
    pub fn tick(&mut self) -> VectorClock {
        self.clock.increment(self.replica);
        self.clock.clone()
    }

    /// Observes a remote timestamp: per-entry max, then one local tick so the
    /// merge itself is causally after everything observed.
    pub fn merge(&mut self, remote: &VectorClock) {
        self.clock.merge(remote);
        self.clock.increment(self.replica);
        trace!(replica = %self.replica, weight = self.clock.weight(), "clock merged");
    }

    /// Raises the clock to at least `clock` without ticking. Used when
    /// rebuilding state from durable storage.
    pub fn restore(&mut self, clock: &VectorClock) {
        self.clock.merge(clock);
    }

    /// Ticks and wraps `payload` into a stamped operation.
    pub fn stamp(
        &mut self,
        entity_type: &str,
        entity_id: EntityId,
        payload: OperationPayload,
    ) -> Operation {
        let timestamp = self.tick();
        let id = OperationId::new(self.replica, timestamp.get(&self.replica));
        Operation::new(id, entity_type, entity_id, payload, timestamp)
    }

    /// `a` happened before `b`.
    #[must_use]
    pub fn happens_before(a: &VectorClock, b: &VectorClock) -> bool {
        a.happens_before(b)
    }

    /// Neither of `a`, `b` happened before the other.
    #[must_use]
    pub fn concurrent(a: &VectorClock, b: &VectorClock) -> bool {
        a.concurrent(b)
    }
}
