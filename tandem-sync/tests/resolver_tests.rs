use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tandem_crdt::CrdtKind;
use tandem_model::{ConflictStrategy, FieldMergeTable, FieldRule, FieldState, MergeHandler};
use tandem_sync::{ConflictResolver, FieldWrite, Resolution, SyncError};
use tandem_types::{EntityId, OperationId, ReplicaId, Stamp, VectorClock};

fn replica(n: u128) -> ReplicaId {
    ReplicaId::from_uuid(uuid::Uuid::from_u128(n))
}

fn clock(entries: &[(u128, u64)]) -> VectorClock {
    VectorClock::from_entries(entries.iter().map(|(r, t)| (replica(*r), *t)))
}

fn stamp(by: u128, c: &VectorClock) -> Stamp {
    Stamp::new(c, OperationId::new(replica(by), c.get(&replica(by))))
}

fn local(value: serde_json::Value, by: u128, c: VectorClock) -> FieldState {
    FieldState::new(value, stamp(by, &c), c)
}

fn remote(value: serde_json::Value, by: u128, c: VectorClock, base_version: u64) -> FieldWrite {
    FieldWrite {
        entity_id: EntityId::from_uuid(uuid::Uuid::from_u128(99)),
        entity_type: "profile".into(),
        field: "name".into(),
        value,
        stamp: stamp(by, &c),
        clock: c,
        base_version,
    }
}

fn resolver() -> ConflictResolver {
    ConflictResolver::new(ConflictStrategy::LastWriteWins)
}

// ── Last writer wins ─────────────────────────────────────────────

#[test]
fn concurrent_writes_of_equal_weight_go_to_higher_replica() {
    let r = resolver();
    let lww = ConflictStrategy::LastWriteWins;

    let mine = local(json!("Ada"), 1, clock(&[(1, 1)]));
    let theirs = remote(json!("Grace"), 2, clock(&[(2, 1)]), 0);
    assert_eq!(r.resolve(Some(&mine), &theirs, &lww).unwrap(), Resolution::TakeRemote);

    let mine = local(json!("Grace"), 2, clock(&[(2, 1)]));
    let theirs = remote(json!("Ada"), 1, clock(&[(1, 1)]), 0);
    assert_eq!(r.resolve(Some(&mine), &theirs, &lww).unwrap(), Resolution::KeepLocal);
}

#[test]
fn causally_later_write_wins_regardless_of_replica() {
    let mine = local(json!("Grace"), 2, clock(&[(2, 1)]));
    let theirs = remote(json!("Ada"), 1, clock(&[(1, 1), (2, 1)]), 0);
    assert_eq!(
        resolver()
            .resolve(Some(&mine), &theirs, &ConflictStrategy::LastWriteWins)
            .unwrap(),
        Resolution::TakeRemote
    );
}

#[test]
fn redelivered_write_is_a_no_op() {
    let c = clock(&[(2, 1)]);
    let mine = local(json!("Grace"), 2, c.clone());
    let theirs = remote(json!("Grace"), 2, c, 0);
    for strategy in [
        ConflictStrategy::LastWriteWins,
        ConflictStrategy::FirstWriteWins,
        ConflictStrategy::UserChoice,
    ] {
        assert_eq!(
            resolver().resolve(Some(&mine), &theirs, &strategy).unwrap(),
            Resolution::KeepLocal
        );
    }
}

#[test]
fn unwritten_field_takes_remote() {
    let theirs = remote(json!("Ada"), 1, clock(&[(1, 1)]), 0);
    assert_eq!(
        resolver()
            .resolve(None, &theirs, &ConflictStrategy::UserChoice)
            .unwrap(),
        Resolution::TakeRemote
    );
}

// ── First writer wins ────────────────────────────────────────────

#[test]
fn write_based_on_current_version_is_accepted() {
    let mine = local(json!("9am"), 1, clock(&[(1, 1)]));
    let theirs = remote(json!("10am"), 2, clock(&[(1, 1), (2, 1)]), 1);
    assert_eq!(
        resolver()
            .resolve(Some(&mine), &theirs, &ConflictStrategy::FirstWriteWins)
            .unwrap(),
        Resolution::TakeRemote
    );
}

#[test]
fn racing_writes_on_same_base_keep_the_first() {
    let r = resolver();
    let fww = ConflictStrategy::FirstWriteWins;

    // The remote write has the smaller stamp, so it was first.
    let mine = local(json!("10am"), 2, clock(&[(2, 1)]));
    let theirs = remote(json!("9am"), 1, clock(&[(1, 1)]), 0);
    let Resolution::Displaced(lost) = r.resolve(Some(&mine), &theirs, &fww).unwrap() else {
        panic!("expected the local write to be displaced");
    };
    assert_eq!(lost.local_value, json!("10am"));
    assert_eq!(lost.remote_value, json!("9am"));
    assert_eq!(r.settle(&lost).unwrap(), json!("9am"));

    let mine = local(json!("9am"), 1, clock(&[(1, 1)]));
    let theirs = remote(json!("10am"), 2, clock(&[(2, 1)]), 0);
    let Resolution::Rejected(record) = r.resolve(Some(&mine), &theirs, &fww).unwrap() else {
        panic!("expected rejection");
    };
    assert_eq!(record.local_value, json!("9am"));
    assert_eq!(record.remote_value, json!("10am"));
}

#[test]
fn write_based_on_unknown_version_is_rejected() {
    let mine = local(json!("9am"), 1, clock(&[(1, 1)]));
    let theirs = remote(json!("noon"), 2, clock(&[(2, 4)]), 5);
    assert!(matches!(
        resolver()
            .resolve(Some(&mine), &theirs, &ConflictStrategy::FirstWriteWins)
            .unwrap(),
        Resolution::Rejected(_)
    ));
}

// ── Field merge ──────────────────────────────────────────────────

struct Longest;

impl MergeHandler for Longest {
    fn merge(&self, _field: &str, local: &FieldState, remote: &FieldState) -> serde_json::Value {
        let a = local.value().as_str().unwrap_or_default();
        let b = remote.value().as_str().unwrap_or_default();
        if (a.len(), a) >= (b.len(), b) { json!(a) } else { json!(b) }
    }
}

fn field_merge(rule: FieldRule) -> ConflictStrategy {
    ConflictStrategy::FieldMerge {
        fields: FieldMergeTable::new().with("name", rule),
    }
}

#[test]
fn field_rules_decide_concurrent_writes() {
    let mut r = resolver();
    r.register("longest", Arc::new(Longest));
    let mine = local(json!(["a", "b"]), 1, clock(&[(1, 1)]));
    let theirs = remote(json!(["b", "c"]), 2, clock(&[(2, 1)]), 0);

    let cases = [
        (FieldRule::RemoteWins, Resolution::TakeRemote),
        (FieldRule::LocalWins, Resolution::KeepLocal),
        (FieldRule::MostRecent, Resolution::TakeRemote),
        (FieldRule::Union, Resolution::Merged(json!(["a", "b", "c"]))),
    ];
    for (rule, expected) in cases {
        assert_eq!(r.resolve(Some(&mine), &theirs, &field_merge(rule)).unwrap(), expected);
    }
}

#[test]
fn custom_handler_merges_by_name() {
    let mut r = resolver();
    r.register("longest", Arc::new(Longest));
    let mine = local(json!("Ada Lovelace"), 1, clock(&[(1, 1)]));
    let theirs = remote(json!("Ada"), 2, clock(&[(2, 1)]), 0);
    let strategy = field_merge(FieldRule::Custom {
        handler: "longest".into(),
    });
    assert_eq!(
        r.resolve(Some(&mine), &theirs, &strategy).unwrap(),
        Resolution::Merged(json!("Ada Lovelace"))
    );
}

#[test]
fn missing_custom_handler_is_a_config_error() {
    let mine = local(json!("x"), 1, clock(&[(1, 1)]));
    let theirs = remote(json!("y"), 2, clock(&[(2, 1)]), 0);
    let strategy = field_merge(FieldRule::Custom {
        handler: "nope".into(),
    });
    assert!(matches!(
        resolver().resolve(Some(&mine), &theirs, &strategy),
        Err(SyncError::Config(_))
    ));
}

#[test]
fn field_rules_only_apply_to_concurrent_writes() {
    let r = resolver();
    // Remote saw the local write: it replaces it even under LocalWins.
    let mine = local(json!("old"), 1, clock(&[(1, 1)]));
    let newer = remote(json!("new"), 2, clock(&[(1, 1), (2, 1)]), 1);
    assert_eq!(
        r.resolve(Some(&mine), &newer, &field_merge(FieldRule::LocalWins)).unwrap(),
        Resolution::TakeRemote
    );

    // Local saw the remote write: a late copy of it never wins.
    let mine = local(json!("new"), 1, clock(&[(1, 1), (2, 1)]));
    let stale = remote(json!("old"), 2, clock(&[(2, 1)]), 0);
    assert_eq!(
        r.resolve(Some(&mine), &stale, &field_merge(FieldRule::RemoteWins)).unwrap(),
        Resolution::KeepLocal
    );
}

#[test]
fn union_of_non_arrays_falls_back_to_most_recent() {
    let mine = local(json!("a"), 1, clock(&[(1, 1)]));
    let theirs = remote(json!("b"), 2, clock(&[(2, 1)]), 0);
    assert_eq!(
        resolver()
            .resolve(Some(&mine), &theirs, &field_merge(FieldRule::Union))
            .unwrap(),
        Resolution::TakeRemote
    );
}

// ── User choice ──────────────────────────────────────────────────

#[test]
fn concurrent_writes_are_deferred_to_the_user() {
    let mine = local(json!("mine"), 1, clock(&[(1, 1)]));
    let theirs = remote(json!("theirs"), 2, clock(&[(2, 1)]), 0);
    let Resolution::Deferred(record) = resolver()
        .resolve(Some(&mine), &theirs, &ConflictStrategy::UserChoice)
        .unwrap()
    else {
        panic!("expected a deferred conflict");
    };
    assert_eq!(record.field, "name");
    assert_eq!(record.local_timestamp, clock(&[(1, 1)]));
    assert_eq!(record.remote_timestamp, clock(&[(2, 1)]));
}

#[test]
fn settle_uses_fallback_strategy() {
    let mine = local(json!("mine"), 1, clock(&[(1, 1)]));
    let theirs = remote(json!("theirs"), 2, clock(&[(2, 1)]), 0);
    let r = resolver();
    let Resolution::Deferred(record) = r
        .resolve(Some(&mine), &theirs, &ConflictStrategy::UserChoice)
        .unwrap()
    else {
        panic!("expected a deferred conflict");
    };
    assert_eq!(r.settle(&record).unwrap(), json!("theirs"));
}

#[test]
fn crdt_types_never_take_field_writes() {
    let theirs = remote(json!(1), 2, clock(&[(2, 1)]), 0);
    let strategy = ConflictStrategy::CrdtNative {
        crdt: CrdtKind::PnCounter,
    };
    assert!(matches!(
        resolver().resolve(None, &theirs, &strategy),
        Err(SyncError::StrategyMismatch { .. })
    ));
}
