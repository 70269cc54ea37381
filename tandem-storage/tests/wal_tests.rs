use std::sync::Arc;
use std::time::Duration;
use tandem_storage::{
    EntryStatus, MemoryStore, Persistence, RetryPolicy, StorageError, Wal,
};
use tandem_types::{EntityId, Operation, OperationId, OperationPayload, ReplicaId, VectorClock};

fn op(replica: ReplicaId, seq: u64) -> Operation {
    Operation::new(
        OperationId::new(replica, seq),
        "tags",
        EntityId::new(),
        OperationPayload::SetAdd {
            element: format!("e{seq}"),
        },
        VectorClock::from_entries([(replica, seq)]),
    )
}

fn open(store: &MemoryStore) -> Wal {
    Wal::open(Arc::new(store.clone()) as Arc<dyn Persistence>).unwrap()
}

fn no_backoff(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
    }
}

// ── Append ──────────────────────────────────────────────────────

#[test]
fn append_assigns_increasing_offsets() {
    let store = MemoryStore::new();
    let wal = open(&store);
    let r = ReplicaId::new();
    assert_eq!(wal.append(op(r, 1)).unwrap(), 1);
    assert_eq!(wal.append(op(r, 2)).unwrap(), 2);
    assert_eq!(wal.last_offset().unwrap(), 2);

    let stored = store.wal_entry(2).unwrap();
    assert_eq!(stored.operation.wal_offset, 2);
    assert_eq!(stored.status, EntryStatus::Pending);
}

#[test]
fn duplicate_append_returns_existing_offset() {
    let wal = open(&MemoryStore::new());
    let r = ReplicaId::new();
    let first = op(r, 1);
    assert_eq!(wal.append(first.clone()).unwrap(), 1);
    assert_eq!(wal.append(first).unwrap(), 1);
    assert_eq!(wal.len().unwrap(), 1);
}

#[test]
fn failed_append_surfaces_and_leaves_log_unchanged() {
    let store = MemoryStore::new();
    let wal = open(&store);
    let r = ReplicaId::new();
    wal.append(op(r, 1)).unwrap();

    store.fail_appends(true);
    let err = wal.append(op(r, 2)).unwrap_err();
    assert!(matches!(err, StorageError::Durability(_)));
    assert_eq!(wal.len().unwrap(), 1);
    assert_eq!(wal.last_offset().unwrap(), 1);

    store.fail_appends(false);
    assert_eq!(wal.append(op(r, 2)).unwrap(), 2);
}

// ── Draining ────────────────────────────────────────────────────

#[test]
fn pending_since_yields_in_append_order() {
    let wal = open(&MemoryStore::new());
    let r = ReplicaId::new();
    for seq in 1..=4 {
        wal.append(op(r, seq)).unwrap();
    }
    wal.mark_synced(OperationId::new(r, 2)).unwrap();

    let offsets: Vec<u64> = wal.pending_since(0).map(|e| e.offset()).collect();
    assert_eq!(offsets, vec![1, 3, 4]);
    let later: Vec<u64> = wal.pending_since(3).map(|e| e.offset()).collect();
    assert_eq!(later, vec![4]);
}

#[test]
fn pending_iterator_is_lazy_and_restartable() {
    let wal = open(&MemoryStore::new());
    let r = ReplicaId::new();
    wal.append(op(r, 1)).unwrap();

    let mut pending = wal.pending_since(0);
    assert_eq!(pending.next().unwrap().offset(), 1);
    wal.append(op(r, 2)).unwrap();
    assert_eq!(pending.next().unwrap().offset(), 2);
    assert!(pending.next().is_none());

    let resume = pending.last_offset();
    wal.append(op(r, 3)).unwrap();
    let rest: Vec<u64> = wal.pending_since(resume).map(|e| e.offset()).collect();
    assert_eq!(rest, vec![3]);
}

// ── Status transitions ──────────────────────────────────────────

#[test]
fn mark_synced_is_idempotent() {
    let wal = open(&MemoryStore::new());
    let r = ReplicaId::new();
    wal.append(op(r, 1)).unwrap();
    let id = OperationId::new(r, 1);
    wal.mark_synced(id).unwrap();
    wal.mark_synced(id).unwrap();
    let entry = wal.get(id).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Synced);
    assert!(entry.synced_at.is_some());
}

#[test]
fn mark_failed_counts_retries_then_fails() {
    let wal = open(&MemoryStore::new());
    let r = ReplicaId::new();
    wal.append(op(r, 1)).unwrap();
    let id = OperationId::new(r, 1);
    let policy = no_backoff(3);

    assert_eq!(wal.mark_failed(id, "timeout", &policy).unwrap(), EntryStatus::Pending);
    assert_eq!(wal.mark_failed(id, "timeout", &policy).unwrap(), EntryStatus::Pending);
    assert_eq!(wal.mark_failed(id, "refused", &policy).unwrap(), EntryStatus::Failed);

    let entry = wal.get(id).unwrap().unwrap();
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.last_error.as_deref(), Some("refused"));
    assert_eq!(wal.pending_since(0).count(), 0);
}

#[test]
fn mark_failed_schedules_backoff() {
    let wal = open(&MemoryStore::new());
    let r = ReplicaId::new();
    wal.append(op(r, 1)).unwrap();
    let id = OperationId::new(r, 1);
    let policy = RetryPolicy {
        max_retries: 5,
        backoff_base: Duration::from_secs(30),
        backoff_max: Duration::from_secs(60),
    };
    wal.mark_failed(id, "offline", &policy).unwrap();
    let entry = wal.get(id).unwrap().unwrap();
    assert!(!entry.is_due(chrono::Utc::now()));
    assert!(entry.is_due(chrono::Utc::now() + chrono::Duration::seconds(31)));
}

#[test]
fn transitions_on_failed_entry_are_rejected() {
    let wal = open(&MemoryStore::new());
    let r = ReplicaId::new();
    wal.append(op(r, 1)).unwrap();
    let id = OperationId::new(r, 1);
    wal.mark_failed(id, "x", &no_backoff(1)).unwrap();

    let err = wal.mark_synced(id).unwrap_err();
    assert!(matches!(
        err,
        StorageError::StaleTransition {
            expected: EntryStatus::Pending,
            actual: EntryStatus::Failed,
            ..
        }
    ));
    assert!(wal.mark_failed(id, "x", &no_backoff(1)).is_err());
}

#[test]
fn requeue_restores_pending_with_fresh_budget() {
    let wal = open(&MemoryStore::new());
    let r = ReplicaId::new();
    wal.append(op(r, 1)).unwrap();
    let id = OperationId::new(r, 1);
    wal.mark_failed(id, "x", &no_backoff(1)).unwrap();

    wal.requeue(id).unwrap();
    let entry = wal.get(id).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert_eq!(entry.retry_count, 0);
    assert!(wal.requeue(id).is_err());
}

#[test]
fn unknown_id_is_not_found() {
    let wal = open(&MemoryStore::new());
    let err = wal.mark_synced(OperationId::new(ReplicaId::new(), 9)).unwrap_err();
    assert!(matches!(err, StorageError::EntryNotFound(_)));
}

// ── Compaction ──────────────────────────────────────────────────

#[test]
fn compact_only_removes_old_synced_entries() {
    let store = MemoryStore::new();
    let wal = open(&store);
    let r = ReplicaId::new();
    for seq in 1..=5 {
        wal.append(op(r, seq)).unwrap();
    }
    wal.mark_synced(OperationId::new(r, 1)).unwrap();
    wal.mark_synced(OperationId::new(r, 2)).unwrap();
    wal.mark_failed(OperationId::new(r, 3), "x", &no_backoff(1)).unwrap();
    wal.mark_synced(OperationId::new(r, 5)).unwrap();

    let removed = wal.compact(5, Duration::ZERO).unwrap();
    assert_eq!(removed, 2);
    let left: Vec<(u64, EntryStatus)> = wal
        .entries()
        .unwrap()
        .iter()
        .map(|e| (e.offset(), e.status))
        .collect();
    assert_eq!(
        left,
        vec![
            (3, EntryStatus::Failed),
            (4, EntryStatus::Pending),
            (5, EntryStatus::Synced),
        ]
    );
    assert!(store.wal_entry(1).is_none());
}

#[test]
fn compact_respects_retention_horizon() {
    let wal = open(&MemoryStore::new());
    let r = ReplicaId::new();
    wal.append(op(r, 1)).unwrap();
    wal.mark_synced(OperationId::new(r, 1)).unwrap();
    assert_eq!(wal.compact(10, Duration::from_secs(3600)).unwrap(), 0);
    assert_eq!(wal.len().unwrap(), 1);
}

#[test]
fn offsets_are_not_reused_after_compaction() {
    let store = MemoryStore::new();
    let wal = open(&store);
    let r = ReplicaId::new();
    wal.append(op(r, 1)).unwrap();
    wal.mark_synced(OperationId::new(r, 1)).unwrap();
    wal.compact(10, Duration::ZERO).unwrap();
    assert!(wal.is_empty().unwrap());
    drop(wal);

    let wal = open(&store);
    assert_eq!(wal.append(op(r, 2)).unwrap(), 2);
}

// ── Crash recovery ──────────────────────────────────────────────

#[test]
fn appended_entries_survive_crash() {
    let store = MemoryStore::new();
    let r = ReplicaId::new();
    {
        let wal = open(&store);
        wal.append(op(r, 1)).unwrap();
        wal.append(op(r, 2)).unwrap();
        wal.mark_synced(OperationId::new(r, 1)).unwrap();
    }

    let recovery = Wal::recover(Arc::new(store.clone())).unwrap();
    let entries = recovery.wal.entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].status, EntryStatus::Synced);
    assert_eq!(entries[1].status, EntryStatus::Pending);
    assert_eq!(entries[1].operation, {
        let mut expected = op(r, 2);
        expected.wal_offset = 2;
        expected.entity_id = entries[1].operation.entity_id;
        expected
    });
    assert!(recovery.snapshots.is_empty());
}

#[test]
fn status_counts_reflect_log() {
    let wal = open(&MemoryStore::new());
    let r = ReplicaId::new();
    for seq in 1..=3 {
        wal.append(op(r, seq)).unwrap();
    }
    wal.mark_synced(OperationId::new(r, 1)).unwrap();
    wal.mark_failed(OperationId::new(r, 2), "x", &no_backoff(1)).unwrap();
    assert_eq!(wal.status_counts().unwrap(), (1, 1, 1));
}
