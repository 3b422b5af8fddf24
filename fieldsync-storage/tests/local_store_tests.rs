use fieldsync_storage::{ConflictStrategy, DeleteOutcome, FailureOutcome, LocalStore, MergeOutcome, StorageError};
use fieldsync_types::{Action, EntityKind, LocalId, OperationId, RemoteRecord, ServerId, SyncStatus, Timestamp, MAX_RETRIES};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

fn make_store() -> LocalStore {
    LocalStore::open_in_memory().unwrap()
}

// ── create ───────────────────────────────────────────────────────

#[test]
fn create_assigns_ids_and_queues_create() {
    let store = make_store();
    let record = store
        .create(EntityKind::WorkOrder, json!({"status": "Aberta"}))
        .unwrap();

    assert_eq!(record.sync_status, SyncStatus::Pending);
    assert!(record.server_id.is_none());
    assert!(!record.deleted);

    let log = store.drain_log(10).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, Action::Create);
    assert_eq!(log[0].entity_local_id, record.local_id);
    assert_eq!(log[0].entity_kind, EntityKind::WorkOrder);
    assert_eq!(log[0].retry_count, 0);
    assert_eq!(log[0].payload, json!({"status": "Aberta"}));
}

#[test]
fn create_rejects_non_object_payload() {
    let store = make_store();
    let err = store.create(EntityKind::Customer, json!([1, 2])).unwrap_err();
    assert!(matches!(err, StorageError::InvalidData(_)));
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[test]
fn offline_id_survives_updates() {
    let store = make_store();
    let record = store.create(EntityKind::WorkOrder, json!({"a": 1})).unwrap();
    let updated = store
        .update(EntityKind::WorkOrder, record.local_id, json!({"a": 2}))
        .unwrap();
    assert_eq!(updated.offline_id, record.offline_id);

    let reread = store.get(EntityKind::WorkOrder, record.local_id).unwrap().unwrap();
    assert_eq!(reread.offline_id, record.offline_id);
}

// ── update ───────────────────────────────────────────────────────

#[test]
fn update_merges_patch_and_queues_update() {
    let store = make_store();
    let record = store
        .create(EntityKind::WorkOrder, json!({"status": "Aberta", "obs": "x"}))
        .unwrap();

    let updated = store
        .update(
            EntityKind::WorkOrder,
            record.local_id,
            json!({"status": "Em Andamento", "obs": null, "km": 12}),
        )
        .unwrap();

    assert_eq!(updated.payload, json!({"status": "Em Andamento", "km": 12}));
    let log = store.drain_log(10).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].action, Action::Update);
    assert_eq!(log[1].payload, updated.payload);
}

#[test]
fn update_unknown_record_is_not_found() {
    let store = make_store();
    let err = store
        .update(EntityKind::WorkOrder, LocalId::new(99), json!({"a": 1}))
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[test]
fn update_with_wrong_kind_is_not_found() {
    let store = make_store();
    let record = store.create(EntityKind::Customer, json!({})).unwrap();
    let err = store
        .update(EntityKind::Appointment, record.local_id, json!({"a": 1}))
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[test]
fn update_after_sync_sets_pending_again() {
    let store = make_store();
    let record = store.create(EntityKind::Customer, json!({"name": "Ana"})).unwrap();
    let entry = store.drain_log(1).unwrap().remove(0);
    store.complete_create(entry.id, &ServerId::new("c-1")).unwrap();
    assert_eq!(
        store.get(EntityKind::Customer, record.local_id).unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );

    let updated = store
        .update(EntityKind::Customer, record.local_id, json!({"name": "Ana Paula"}))
        .unwrap();
    assert_eq!(updated.sync_status, SyncStatus::Pending);
    assert_eq!(updated.server_id, Some(ServerId::new("c-1")));
}

// ── query ────────────────────────────────────────────────────────

#[test]
fn query_filters_by_kind_and_predicate() {
    let store = make_store();
    store.create(EntityKind::WorkOrder, json!({"status": "Aberta"})).unwrap();
    store.create(EntityKind::WorkOrder, json!({"status": "Concluída"})).unwrap();
    store.create(EntityKind::Customer, json!({"status": "Aberta"})).unwrap();

    let open = store
        .query(EntityKind::WorkOrder, |r| r.field("status") == Some(&json!("Aberta")))
        .unwrap();
    assert_eq!(open.len(), 1);

    let all = store.query(EntityKind::WorkOrder, |_| true).unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].local_id < all[1].local_id);
}

// ── drain / acknowledge ──────────────────────────────────────────

#[test]
fn drain_log_is_oldest_first_and_non_destructive() {
    let store = make_store();
    for i in 0..5 {
        store.create(EntityKind::Appointment, json!({"n": i})).unwrap();
    }

    let first = store.drain_log(3).unwrap();
    assert_eq!(first.len(), 3);
    assert!(first[0].id < first[1].id && first[1].id < first[2].id);
    assert_eq!(first[0].payload, json!({"n": 0}));

    let again = store.drain_log(3).unwrap();
    assert_eq!(first, again);
    assert_eq!(store.pending_count().unwrap(), 5);
}

#[test]
fn complete_create_sets_server_id_and_synced() {
    let store = make_store();
    let record = store.create(EntityKind::WorkOrder, json!({"a": 1})).unwrap();
    let entry = store.drain_log(1).unwrap().remove(0);

    store.complete_create(entry.id, &ServerId::new("wo-77")).unwrap();

    let reread = store.get(EntityKind::WorkOrder, record.local_id).unwrap().unwrap();
    assert_eq!(reread.server_id, Some(ServerId::new("wo-77")));
    assert_eq!(reread.sync_status, SyncStatus::Synced);
    assert_eq!(store.pending_count().unwrap(), 0);

    let found = store
        .find_by_server_id(EntityKind::WorkOrder, &ServerId::new("wo-77"))
        .unwrap()
        .unwrap();
    assert_eq!(found.local_id, record.local_id);
}

#[test]
fn complete_create_keeps_pending_while_updates_remain() {
    let store = make_store();
    let record = store.create(EntityKind::WorkOrder, json!({"a": 1})).unwrap();
    store.update(EntityKind::WorkOrder, record.local_id, json!({"a": 2})).unwrap();
    let create = store.drain_log(1).unwrap().remove(0);

    store.complete_create(create.id, &ServerId::new("wo-1")).unwrap();
    let reread = store.get(EntityKind::WorkOrder, record.local_id).unwrap().unwrap();
    assert_eq!(reread.sync_status, SyncStatus::Pending);

    let update = store.drain_log(1).unwrap().remove(0);
    store.acknowledge(update.id).unwrap();
    let reread = store.get(EntityKind::WorkOrder, record.local_id).unwrap().unwrap();
    assert_eq!(reread.sync_status, SyncStatus::Synced);
}

#[test]
fn complete_create_rejects_update_entry() {
    let store = make_store();
    let record = store.create(EntityKind::WorkOrder, json!({})).unwrap();
    store.update(EntityKind::WorkOrder, record.local_id, json!({"a": 1})).unwrap();
    let update = store.drain_log(2).unwrap().remove(1);
    let err = store.complete_create(update.id, &ServerId::new("x")).unwrap_err();
    assert!(matches!(err, StorageError::InvalidData(_)));
}

#[test]
fn acknowledge_unknown_entry_is_not_found() {
    let store = make_store();
    let err = store.acknowledge(OperationId::new(42)).unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

// ── delete ───────────────────────────────────────────────────────

#[test]
fn delete_local_only_record_discards_it() {
    let store = make_store();
    let record = store.create(EntityKind::Signature, json!({"by": "João"})).unwrap();

    let outcome = store.delete(EntityKind::Signature, record.local_id).unwrap();
    assert_eq!(outcome, DeleteOutcome::Discarded);
    assert_eq!(store.pending_count().unwrap(), 0);
    assert!(store.get(EntityKind::Signature, record.local_id).unwrap().is_none());
}

#[test]
fn delete_synced_record_tombstones_until_ack() {
    let store = make_store();
    let record = store.create(EntityKind::Customer, json!({"name": "Ana"})).unwrap();
    let create = store.drain_log(1).unwrap().remove(0);
    store.complete_create(create.id, &ServerId::new("c-9")).unwrap();

    let outcome = store.delete(EntityKind::Customer, record.local_id).unwrap();
    assert_eq!(outcome, DeleteOutcome::Queued);
    assert!(store.get(EntityKind::Customer, record.local_id).unwrap().is_none());
    assert!(store.query(EntityKind::Customer, |_| true).unwrap().is_empty());

    let tombstone = store
        .find_by_server_id(EntityKind::Customer, &ServerId::new("c-9"))
        .unwrap()
        .unwrap();
    assert!(tombstone.deleted);

    let delete = store.drain_log(1).unwrap().remove(0);
    assert_eq!(delete.action, Action::Delete);
    store.acknowledge(delete.id).unwrap();
    assert!(store
        .find_by_server_id(EntityKind::Customer, &ServerId::new("c-9"))
        .unwrap()
        .is_none());
}

#[test]
fn delete_twice_is_not_found() {
    let store = make_store();
    let record = store.create(EntityKind::Customer, json!({})).unwrap();
    store.delete(EntityKind::Customer, record.local_id).unwrap();
    let err = store.delete(EntityKind::Customer, record.local_id).unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

// ── record_failure / abandon ─────────────────────────────────────

#[test]
fn record_failure_counts_until_ceiling() {
    let store = make_store();
    let record = store.create(EntityKind::WorkOrder, json!({})).unwrap();
    let entry = store.drain_log(1).unwrap().remove(0);

    assert_eq!(
        store.record_failure(entry.id, "timeout", MAX_RETRIES).unwrap(),
        FailureOutcome::Retrying { retry_count: 1 }
    );
    assert_eq!(
        store.record_failure(entry.id, "timeout", MAX_RETRIES).unwrap(),
        FailureOutcome::Retrying { retry_count: 2 }
    );
    let queued = store.drain_log(1).unwrap().remove(0);
    assert_eq!(queued.retry_count, 2);
    assert_eq!(queued.last_error.as_deref(), Some("timeout"));

    let last = store.record_failure(entry.id, "timeout", MAX_RETRIES).unwrap();
    assert_eq!(last, FailureOutcome::Abandoned { retry_count: 3 });
    assert!(last.is_abandoned());
    assert_eq!(store.pending_count().unwrap(), 0);

    let reread = store.get(EntityKind::WorkOrder, record.local_id).unwrap().unwrap();
    assert_eq!(reread.sync_status, SyncStatus::Error);
}

#[test]
fn abandoned_create_drops_dependent_entries() {
    let store = make_store();
    let record = store.create(EntityKind::WorkOrder, json!({})).unwrap();
    store.update(EntityKind::WorkOrder, record.local_id, json!({"a": 1})).unwrap();
    let other = store.create(EntityKind::WorkOrder, json!({})).unwrap();

    let create = store.drain_log(1).unwrap().remove(0);
    store.abandon(create.id, "422 invalid").unwrap();

    assert!(store.entries_for(EntityKind::WorkOrder, record.local_id).unwrap().is_empty());
    assert_eq!(store.entries_for(EntityKind::WorkOrder, other.local_id).unwrap().len(), 1);
}

#[test]
fn abandoned_delete_restores_record_as_error() {
    let store = make_store();
    let record = store.create(EntityKind::Customer, json!({})).unwrap();
    let create = store.drain_log(1).unwrap().remove(0);
    store.complete_create(create.id, &ServerId::new("c-1")).unwrap();
    store.delete(EntityKind::Customer, record.local_id).unwrap();

    let delete = store.drain_log(1).unwrap().remove(0);
    store.abandon(delete.id, "409 conflict").unwrap();

    let reread = store.get(EntityKind::Customer, record.local_id).unwrap().unwrap();
    assert!(!reread.deleted);
    assert_eq!(reread.sync_status, SyncStatus::Error);
}

#[test]
fn retry_record_requeues_errored_record() {
    let store = make_store();
    let record = store.create(EntityKind::WorkOrder, json!({"a": 1})).unwrap();
    let create = store.drain_log(1).unwrap().remove(0);
    store.abandon(create.id, "boom").unwrap();

    let retried = store.retry_record(EntityKind::WorkOrder, record.local_id).unwrap();
    assert_eq!(retried.sync_status, SyncStatus::Pending);
    let log = store.drain_log(10).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, Action::Create);
    assert_eq!(log[0].retry_count, 0);
}

#[test]
fn retry_record_is_noop_for_pending_record() {
    let store = make_store();
    let record = store.create(EntityKind::WorkOrder, json!({})).unwrap();
    store.retry_record(EntityKind::WorkOrder, record.local_id).unwrap();
    assert_eq!(store.pending_count().unwrap(), 1);
}

// ── merge_remote ─────────────────────────────────────────────────

#[test]
fn merge_remote_inserts_unknown_record_as_synced() {
    let store = make_store();
    let remote = RemoteRecord::new("wo-5", json!({"status": "Aberta"}));

    let outcome = store
        .merge_remote(EntityKind::WorkOrder, &remote, ConflictStrategy::Merge)
        .unwrap();
    let MergeOutcome::Inserted(local_id) = outcome else {
        panic!("expected Inserted, got {outcome:?}");
    };
    assert!(outcome.is_download());

    let record = store.get(EntityKind::WorkOrder, local_id).unwrap().unwrap();
    assert_eq!(record.server_id, Some(ServerId::new("wo-5")));
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[test]
fn merge_remote_replaces_synced_record() {
    let store = make_store();
    let remote = RemoteRecord::new("wo-5", json!({"status": "Aberta"}));
    store.merge_remote(EntityKind::WorkOrder, &remote, ConflictStrategy::Merge).unwrap();

    let again = store.merge_remote(EntityKind::WorkOrder, &remote, ConflictStrategy::Merge).unwrap();
    assert!(matches!(again, MergeOutcome::Unchanged(_)));

    let changed = RemoteRecord::new("wo-5", json!({"status": "Concluída"}));
    let outcome = store.merge_remote(EntityKind::WorkOrder, &changed, ConflictStrategy::Local).unwrap();
    assert!(matches!(outcome, MergeOutcome::Updated(_)));
    let record = store.get(EntityKind::WorkOrder, outcome.local_id()).unwrap().unwrap();
    assert_eq!(record.payload, json!({"status": "Concluída"}));
}

fn pending_synced_record(store: &LocalStore) -> LocalId {
    let record = store
        .create(EntityKind::WorkOrder, json!({"status": "Aberta"}))
        .unwrap();
    let create = store.drain_log(1).unwrap().remove(0);
    store.complete_create(create.id, &ServerId::new("wo-1")).unwrap();
    store
        .update(
            EntityKind::WorkOrder,
            record.local_id,
            json!({"status": "Em Andamento", "observacoes": "x"}),
        )
        .unwrap();
    record.local_id
}

#[test]
fn merge_remote_merge_strategy_preserves_local_fields() {
    let store = make_store();
    let local_id = pending_synced_record(&store);
    let remote = RemoteRecord::new("wo-1", json!({"status": "Concluída", "tecnico": "João"}));

    let outcome = store.merge_remote(EntityKind::WorkOrder, &remote, ConflictStrategy::Merge).unwrap();
    assert_eq!(outcome, MergeOutcome::Updated(local_id));

    let record = store.get(EntityKind::WorkOrder, local_id).unwrap().unwrap();
    assert_eq!(
        record.payload,
        json!({"status": "Concluída", "observacoes": "x", "tecnico": "João"})
    );
    assert_eq!(record.sync_status, SyncStatus::Pending);

    // The queued UPDATE replays the merged state.
    let log = store.entries_for(EntityKind::WorkOrder, local_id).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].payload, record.payload);
}

#[test]
fn merge_remote_server_strategy_discards_local_edits() {
    let store = make_store();
    let local_id = pending_synced_record(&store);
    let remote = RemoteRecord::new("wo-1", json!({"status": "Concluída"}));

    store.merge_remote(EntityKind::WorkOrder, &remote, ConflictStrategy::Server).unwrap();

    let record = store.get(EntityKind::WorkOrder, local_id).unwrap().unwrap();
    assert_eq!(record.payload, json!({"status": "Concluída"}));
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[test]
fn merge_remote_local_strategy_keeps_local() {
    let store = make_store();
    let local_id = pending_synced_record(&store);
    let remote = RemoteRecord::new("wo-1", json!({"status": "Concluída"}));

    let outcome = store.merge_remote(EntityKind::WorkOrder, &remote, ConflictStrategy::Local).unwrap();
    assert_eq!(outcome, MergeOutcome::Kept(local_id));
    assert!(!outcome.is_download());

    let record = store.get(EntityKind::WorkOrder, local_id).unwrap().unwrap();
    assert_eq!(record.payload, json!({"status": "Em Andamento", "observacoes": "x"}));
    assert_eq!(store.pending_count().unwrap(), 1);
}

#[test]
fn merge_remote_links_by_offline_id() {
    let store = make_store();
    let record = store.create(EntityKind::WorkOrder, json!({"status": "Aberta"})).unwrap();
    let remote = RemoteRecord::new("wo-3", json!({"status": "Aberta"}))
        .with_offline_id(record.offline_id);

    let outcome = store.merge_remote(EntityKind::WorkOrder, &remote, ConflictStrategy::Merge).unwrap();
    assert_eq!(outcome.local_id(), record.local_id);
    assert_eq!(store.query(EntityKind::WorkOrder, |_| true).unwrap().len(), 1);

    let linked = store.get(EntityKind::WorkOrder, record.local_id).unwrap().unwrap();
    assert_eq!(linked.server_id, Some(ServerId::new("wo-3")));

    // The lost-ack CREATE is replayed as an UPDATE against the linked id.
    let log = store.entries_for(EntityKind::WorkOrder, record.local_id).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, Action::Update);
}

#[test]
fn merge_remote_skips_tombstones() {
    let store = make_store();
    let record = store.create(EntityKind::Customer, json!({})).unwrap();
    let create = store.drain_log(1).unwrap().remove(0);
    store.complete_create(create.id, &ServerId::new("c-1")).unwrap();
    store.delete(EntityKind::Customer, record.local_id).unwrap();

    let remote = RemoteRecord::new("c-1", json!({"name": "Ana"}));
    let outcome = store.merge_remote(EntityKind::Customer, &remote, ConflictStrategy::Server).unwrap();
    assert_eq!(outcome, MergeOutcome::SkippedTombstone(record.local_id));
    assert_eq!(store.pending_count().unwrap(), 1);
}

#[test]
fn server_copy_of_discarded_record_is_queued_for_delete() {
    let store = make_store();
    let record = store.create(EntityKind::WorkOrder, json!({"status": "Aberta"})).unwrap();
    assert_eq!(
        store.delete(EntityKind::WorkOrder, record.local_id).unwrap(),
        DeleteOutcome::Discarded
    );

    // The CREATE reached the server before the local delete.
    let remote = RemoteRecord::new("wo-7", json!({"status": "Aberta"}))
        .with_offline_id(record.offline_id);
    let outcome = store.merge_remote(EntityKind::WorkOrder, &remote, ConflictStrategy::Merge).unwrap();
    let MergeOutcome::SkippedTombstone(tombstone) = outcome else {
        panic!("expected a tombstone, got {outcome:?}");
    };
    assert!(!outcome.is_download());
    assert!(store.query(EntityKind::WorkOrder, |_| true).unwrap().is_empty());

    let log = store.entries_for(EntityKind::WorkOrder, tombstone).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, Action::Delete);
    let hidden = store.find_by_server_id(EntityKind::WorkOrder, &ServerId::new("wo-7")).unwrap().unwrap();
    assert!(hidden.deleted);

    // A repeated pull finds the tombstone by server id.
    let again = store.merge_remote(EntityKind::WorkOrder, &remote, ConflictStrategy::Merge).unwrap();
    assert_eq!(again, MergeOutcome::SkippedTombstone(tombstone));
    assert_eq!(store.pending_count().unwrap(), 1);

    store.acknowledge(log[0].id).unwrap();
    assert!(store.find_by_server_id(EntityKind::WorkOrder, &ServerId::new("wo-7")).unwrap().is_none());
}

#[test]
fn discarded_offline_id_does_not_affect_other_kinds() {
    let store = make_store();
    let record = store.create(EntityKind::Customer, json!({})).unwrap();
    store.delete(EntityKind::Customer, record.local_id).unwrap();

    let remote = RemoteRecord::new("wo-8", json!({})).with_offline_id(record.offline_id);
    let outcome = store.merge_remote(EntityKind::WorkOrder, &remote, ConflictStrategy::Merge).unwrap();
    assert!(matches!(outcome, MergeOutcome::Inserted(_)));
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[test]
fn merge_remote_rejects_non_object_payload() {
    let store = make_store();
    let remote = RemoteRecord::new("x", json!("oops"));
    let err = store.merge_remote(EntityKind::Customer, &remote, ConflictStrategy::Merge).unwrap_err();
    assert!(matches!(err, StorageError::InvalidData(_)));
}

// ── metadata ─────────────────────────────────────────────────────

#[test]
fn last_sync_time_roundtrip() {
    let store = make_store();
    assert!(store.last_sync_time().unwrap().is_none());
    let at = Timestamp::from_millis(1_700_000_000_000);
    store.set_last_sync_time(at).unwrap();
    assert_eq!(store.last_sync_time().unwrap(), Some(at));
}

#[test]
fn corrupt_last_sync_time_is_invalid_data() {
    let store = make_store();
    store.set_meta("last_sync_time", "soon").unwrap();
    assert!(matches!(store.last_sync_time().unwrap_err(), StorageError::InvalidData(_)));
}

// ── durability ───────────────────────────────────────────────────

#[test]
fn pending_entry_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("field.db");

    let record = {
        let store = LocalStore::open(&path).unwrap();
        store.create(EntityKind::WorkOrder, json!({"status": "Aberta"})).unwrap()
    };

    let reopened = LocalStore::open(&path).unwrap();
    let log = reopened.drain_log(10).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, Action::Create);
    assert_eq!(log[0].retry_count, 0);
    assert_eq!(log[0].entity_local_id, record.local_id);

    let reread = reopened.get(EntityKind::WorkOrder, record.local_id).unwrap().unwrap();
    assert_eq!(reread.offline_id, record.offline_id);
    assert_eq!(reread.sync_status, SyncStatus::Pending);
}

#[test]
fn last_sync_time_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("field.db");
    let at = Timestamp::from_millis(1_234);
    LocalStore::open(&path).unwrap().set_last_sync_time(at).unwrap();
    assert_eq!(LocalStore::open(&path).unwrap().last_sync_time().unwrap(), Some(at));
}
