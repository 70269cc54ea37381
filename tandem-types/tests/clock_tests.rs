use proptest::prelude::*;
use tandem_types::{CausalOrder, OperationId, ReplicaId, Stamp, VectorClock};

fn replica(n: u8) -> ReplicaId {
    ReplicaId::from_uuid(uuid::Uuid::from_bytes([
        n, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ]))
}

fn clock(entries: &[(u8, u64)]) -> VectorClock {
    VectorClock::from_entries(entries.iter().map(|&(r, t)| (replica(r), t)))
}

#[test]
fn missing_entries_are_zero() {
    let c = clock(&[(1, 3)]);
    assert_eq!(c.get(&replica(1)), 3);
    assert_eq!(c.get(&replica(2)), 0);
}

#[test]
fn zero_entries_are_ignored() {
    assert_eq!(clock(&[(1, 0)]), VectorClock::new());
    assert!(clock(&[(1, 0)]).is_empty());
}

#[test]
fn increment_returns_new_time() {
    let mut c = VectorClock::new();
    assert_eq!(c.increment(replica(1)), 1);
    assert_eq!(c.increment(replica(1)), 2);
    assert_eq!(c.get(&replica(1)), 2);
}

#[test]
fn update_never_lowers() {
    let mut c = clock(&[(1, 5)]);
    c.update(replica(1), 2);
    assert_eq!(c.get(&replica(1)), 5);
}

#[test]
fn merge_takes_per_replica_max() {
    let a = clock(&[(1, 3), (2, 1)]);
    let b = clock(&[(1, 1), (2, 4), (3, 2)]);
    let m = a.merged(&b);
    assert_eq!(m, clock(&[(1, 3), (2, 4), (3, 2)]));
}

#[test]
fn compare_before_after_equal() {
    let a = clock(&[(1, 1)]);
    let b = clock(&[(1, 2)]);
    assert_eq!(a.compare(&b), CausalOrder::Before);
    assert_eq!(b.compare(&a), CausalOrder::After);
    assert_eq!(a.compare(&a.clone()), CausalOrder::Equal);
    assert!(a.happens_before(&b));
    assert!(!b.happens_before(&a));
}

#[test]
fn compare_concurrent() {
    let a = clock(&[(1, 1)]);
    let b = clock(&[(2, 1)]);
    assert!(a.concurrent(&b));
    assert!(b.concurrent(&a));
    assert!(!a.happens_before(&b));
}

#[test]
fn equal_clocks_are_not_concurrent() {
    let a = clock(&[(1, 2), (2, 2)]);
    assert!(!a.concurrent(&a.clone()));
    assert!(!a.happens_before(&a.clone()));
}

#[test]
fn dominates_includes_equal() {
    let a = clock(&[(1, 2)]);
    assert!(a.dominates(&a.clone()));
    assert!(a.dominates(&clock(&[(1, 1)])));
    assert!(!a.dominates(&clock(&[(2, 1)])));
}

#[test]
fn weight_is_sum_of_entries() {
    assert_eq!(clock(&[(1, 2), (2, 3)]).weight(), 5);
    assert_eq!(VectorClock::new().weight(), 0);
}

#[test]
fn serde_roundtrip() {
    let c = clock(&[(1, 2), (7, 9)]);
    let json = serde_json::to_string(&c).unwrap();
    let parsed: VectorClock = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, c);
}

// ── Stamp ─────────────────────────────────────────────────────────

#[test]
fn stamp_concurrent_tie_breaks_by_replica() {
    let a = Stamp::new(&clock(&[(1, 1)]), OperationId::new(replica(1), 1));
    let b = Stamp::new(&clock(&[(2, 1)]), OperationId::new(replica(2), 1));
    assert!(b > a);
}

#[test]
fn stamp_zero_loses_to_everything() {
    let a = Stamp::new(&clock(&[(1, 1)]), OperationId::new(replica(1), 1));
    assert!(Stamp::zero() < a);
}

fn clock_strategy() -> impl Strategy<Value = VectorClock> {
    prop::collection::vec((0u8..5, 0u64..20), 0..6)
        .prop_map(|entries| VectorClock::from_entries(entries.into_iter().map(|(r, t)| (replica(r), t))))
}

proptest! {
    /// Happened-before always implies a strictly smaller stamp.
    #[test]
    fn stamp_respects_causality(a in clock_strategy(), b in clock_strategy()) {
        let sa = Stamp::new(&a, OperationId::new(replica(1), 1));
        let sb = Stamp::new(&b, OperationId::new(replica(2), 1));
        if a.happens_before(&b) {
            prop_assert!(sa < sb);
        }
    }

    #[test]
    fn merge_is_commutative(a in clock_strategy(), b in clock_strategy()) {
        prop_assert_eq!(a.merged(&b), b.merged(&a));
    }

    #[test]
    fn merge_is_associative(a in clock_strategy(), b in clock_strategy(), c in clock_strategy()) {
        prop_assert_eq!(a.merged(&b).merged(&c), a.merged(&b.merged(&c)));
    }

    #[test]
    fn merge_is_idempotent(a in clock_strategy()) {
        prop_assert_eq!(a.merged(&a), a);
    }

    #[test]
    fn merged_dominates_both(a in clock_strategy(), b in clock_strategy()) {
        let m = a.merged(&b);
        prop_assert!(m.dominates(&a));
        prop_assert!(m.dominates(&b));
    }

    #[test]
    fn compare_is_antisymmetric(a in clock_strategy(), b in clock_strategy()) {
        let expected = match a.compare(&b) {
            CausalOrder::Before => CausalOrder::After,
            CausalOrder::After => CausalOrder::Before,
            other => other,
        };
        prop_assert_eq!(b.compare(&a), expected);
    }
}
