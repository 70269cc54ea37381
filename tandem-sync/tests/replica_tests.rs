use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tandem_crdt::{CrdtKind, DocumentState};
use tandem_model::{ConflictStrategy, DeletePolicy, EntitySchema};
use tandem_storage::{MemoryStore, SqliteStore, StorageError};
use tandem_sync::{Replica, SyncConfig, SyncError};
use tandem_types::{EntityId, OperationPayload, ReplicaId};

fn config() -> SyncConfig {
    SyncConfig::default()
        .with_schema(EntitySchema::crdt("likes", CrdtKind::PnCounter))
        .with_schema(EntitySchema::crdt("views", CrdtKind::GCounter))
        .with_schema(EntitySchema::crdt("tags", CrdtKind::LwwSet))
        .with_schema(EntitySchema::crdt("doc", CrdtKind::Text))
        .with_schema(EntitySchema::new("profile", ConflictStrategy::LastWriteWins))
        .with_schema(EntitySchema::new("booking", ConflictStrategy::FirstWriteWins))
        .with_schema(
            EntitySchema::new("task", ConflictStrategy::LastWriteWins)
                .with_delete_policy(DeletePolicy::DeleteWins),
        )
}

fn open(store: &MemoryStore) -> Replica {
    open_as(ReplicaId::new(), store)
}

fn open_as(id: ReplicaId, store: &MemoryStore) -> Replica {
    Replica::open(id, config(), Arc::new(store.clone())).unwrap()
}

// ── Counters ─────────────────────────────────────────────────────

#[test]
fn counter_increments_and_decrements() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    assert_eq!(replica.increment("likes", id, 5).unwrap(), 5);
    assert_eq!(replica.decrement("likes", id, 2).unwrap(), 3);
    assert_eq!(replica.counter_value(id).unwrap(), Some(3));
    assert_eq!(replica.document(id).unwrap().unwrap().state(), DocumentState::Active);
}

#[test]
fn counter_operations_carry_cumulative_totals() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    replica.increment("likes", id, 2).unwrap();
    replica.increment("likes", id, 3).unwrap();
    replica.decrement("likes", id, 1).unwrap();

    let payloads: Vec<_> = replica
        .wal()
        .entries()
        .unwrap()
        .into_iter()
        .map(|e| e.operation.payload)
        .collect();
    assert_eq!(
        payloads.last(),
        Some(&OperationPayload::Counter {
            delta: -1,
            positive: 5,
            negative: 1
        })
    );
}

#[test]
fn grow_only_counter_refuses_decrement_without_logging() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    replica.increment("views", id, 1).unwrap();
    assert!(matches!(
        replica.decrement("views", id, 1),
        Err(SyncError::StrategyMismatch { .. })
    ));
    assert_eq!(replica.wal().len().unwrap(), 1);
    assert_eq!(replica.counter_value(id).unwrap(), Some(1));
}

#[test]
fn huge_counter_amounts_saturate() {
    let replica = open(&MemoryStore::new());
    let (likes, views) = (EntityId::new(), EntityId::new());
    assert_eq!(replica.increment("likes", likes, u64::MAX).unwrap(), i64::MAX);
    assert_eq!(replica.decrement("likes", likes, u64::MAX).unwrap(), 0);
    assert_eq!(replica.increment("views", views, u64::MAX).unwrap(), i64::MAX);
    assert_eq!(replica.increment("views", views, 1).unwrap(), i64::MAX);
}

// ── Sets and text ────────────────────────────────────────────────

#[test]
fn set_add_and_remove() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    replica.add_to_set("tags", id, "rust").unwrap();
    replica.add_to_set("tags", id, "crdt").unwrap();
    replica.remove_from_set("tags", id, "rust").unwrap();
    assert_eq!(replica.set_members(id).unwrap(), Some(vec!["crdt".to_string()]));

    // Re-adding after a remove wins: the add has the newer stamp.
    replica.add_to_set("tags", id, "rust").unwrap();
    let mut members = replica.set_members(id).unwrap().unwrap();
    members.sort();
    assert_eq!(members, vec!["crdt", "rust"]);
}

#[test]
fn text_insert_and_delete() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    replica.insert_text("doc", id, 0, "cat").unwrap();
    replica.insert_text("doc", id, 3, "s").unwrap();
    replica.insert_text("doc", id, 0, "the ").unwrap();
    assert_eq!(replica.text(id).unwrap().as_deref(), Some("the cats"));

    replica.delete_text("doc", id, 0, 4).unwrap();
    assert_eq!(replica.text(id).unwrap().as_deref(), Some("cats"));
}

#[test]
fn empty_text_edits_are_not_logged() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    replica.insert_text("doc", id, 0, "").unwrap();
    replica.delete_text("doc", id, 0, 10).unwrap();
    assert!(replica.wal().is_empty().unwrap());
}

// ── Plain entities ───────────────────────────────────────────────

#[test]
fn field_versions_and_optimistic_lock() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    assert_eq!(replica.set_field("booking", id, "slot", json!("9am"), Some(0)).unwrap(), 1);
    assert_eq!(replica.set_field("booking", id, "slot", json!("10am"), Some(1)).unwrap(), 2);

    let err = replica
        .set_field("booking", id, "slot", json!("noon"), Some(1))
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::VersionConflict {
            expected: 1,
            actual: 2,
            ..
        }
    ));
    let entity = replica.entity(id).unwrap().unwrap();
    assert_eq!(entity.get_str("/slot").as_deref(), Some("10am"));
}

#[test]
fn expected_version_is_ignored_outside_first_write_wins() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    replica.set_field("profile", id, "name", json!("Ada"), None).unwrap();
    replica.set_field("profile", id, "name", json!("Grace"), Some(7)).unwrap();
    let entity = replica.entity(id).unwrap().unwrap();
    assert_eq!(entity.data(), json!({"name": "Grace"}));
}

#[test]
fn delete_hides_entity_until_written_again() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    replica.set_field("profile", id, "name", json!("Ada"), None).unwrap();
    replica.delete_entity("profile", id).unwrap();
    assert!(replica.entity(id).unwrap().is_none());

    replica.set_field("profile", id, "name", json!("Ada L."), None).unwrap();
    assert!(replica.entity(id).unwrap().is_some());
}

#[test]
fn local_delete_after_update_holds_under_delete_wins() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    replica.set_field("task", id, "title", json!("write docs"), None).unwrap();
    replica.delete_entity("task", id).unwrap();
    assert!(replica.entity(id).unwrap().is_none());
}

// ── Type checks ──────────────────────────────────────────────────

#[test]
fn undeclared_entity_type_is_rejected() {
    let replica = open(&MemoryStore::new());
    assert!(matches!(
        replica.increment("unknown", EntityId::new(), 1),
        Err(SyncError::UnknownEntityType(t)) if t == "unknown"
    ));
}

#[test]
fn entity_id_is_bound_to_one_type() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    replica.increment("likes", id, 1).unwrap();
    assert!(matches!(
        replica.add_to_set("tags", id, "x"),
        Err(SyncError::TypeMismatch { .. })
    ));
}

#[test]
fn wrong_operation_for_type_is_rejected() {
    let replica = open(&MemoryStore::new());
    let id = EntityId::new();
    assert!(matches!(
        replica.set_field("likes", id, "n", json!(1), None),
        Err(SyncError::StrategyMismatch { .. })
    ));
    assert!(matches!(
        replica.insert_text("profile", EntityId::new(), 0, "x"),
        Err(SyncError::StrategyMismatch { .. })
    ));
}

// ── Durability ───────────────────────────────────────────────────

#[test]
fn failed_append_leaves_state_untouched() {
    let store = MemoryStore::new();
    let replica = open(&store);
    let id = EntityId::new();
    replica.increment("likes", id, 1).unwrap();

    store.fail_appends(true);
    assert!(matches!(
        replica.increment("likes", id, 5),
        Err(SyncError::Durability(StorageError::Durability(_)))
    ));
    assert_eq!(replica.counter_value(id).unwrap(), Some(1));
    assert_eq!(replica.wal().len().unwrap(), 1);

    store.fail_appends(false);
    assert_eq!(replica.increment("likes", id, 5).unwrap(), 6);
}

#[test]
fn reopen_replays_the_log() {
    let store = MemoryStore::new();
    let id = ReplicaId::new();
    let (counter, doc, profile) = (EntityId::new(), EntityId::new(), EntityId::new());
    let sequence = {
        let replica = open_as(id, &store);
        replica.increment("likes", counter, 4).unwrap();
        replica.insert_text("doc", doc, 0, "hello").unwrap();
        replica.set_field("profile", profile, "name", json!("Ada"), None).unwrap();
        replica.clock().unwrap().get(&id)
    };

    let replica = open_as(id, &store);
    assert_eq!(replica.counter_value(counter).unwrap(), Some(4));
    assert_eq!(replica.text(doc).unwrap().as_deref(), Some("hello"));
    assert_eq!(
        replica.entity(profile).unwrap().unwrap().get_str("/name").as_deref(),
        Some("Ada")
    );
    assert_eq!(replica.clock().unwrap().get(&id), sequence);

    // New writes continue the sequence instead of reusing it.
    replica.increment("likes", counter, 1).unwrap();
    let last = replica.wal().entries().unwrap().pop().unwrap();
    assert_eq!(last.operation.id.sequence, sequence + 1);
}

#[test]
fn reopen_after_compaction_uses_snapshots() {
    let store = MemoryStore::new();
    let id = ReplicaId::new();
    let doc = EntityId::new();
    {
        let replica = open_as(id, &store);
        replica.insert_text("doc", doc, 0, "draft").unwrap();
        // Entries are still pending, so nothing is removed.
        assert_eq!(replica.compact().unwrap(), 0);
        replica.insert_text("doc", doc, 5, "!").unwrap();
    }
    let replica = open_as(id, &store);
    assert_eq!(replica.text(doc).unwrap().as_deref(), Some("draft!"));
}

#[test]
fn sqlite_backed_replica_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tandem.db");
    let id = ReplicaId::new();
    let tags = EntityId::new();
    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let replica = Replica::open(id, config(), store).unwrap();
        replica.add_to_set("tags", tags, "offline").unwrap();
        replica.add_to_set("tags", tags, "first").unwrap();
    }
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let replica = Replica::open(id, config(), store).unwrap();
    let mut members = replica.set_members(tags).unwrap().unwrap();
    members.sort();
    assert_eq!(members, vec!["first", "offline"]);
    assert_eq!(replica.wal().status_counts().unwrap(), (2, 0, 0));
}
