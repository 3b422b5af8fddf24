use fieldsync_storage::{LocalStore, StorageError};
use fieldsync_types::{EntityKind, LocalId, ServerId};
use serde_json::json;

#[test]
fn enqueue_and_list_uploads() {
    let store = LocalStore::open_in_memory().unwrap();
    let signature = store.create(EntityKind::Signature, json!({"by": "João"})).unwrap();

    let ticket = store.enqueue_upload(signature.local_id, "/data/sig-1.png").unwrap();
    assert_eq!(ticket.attempts, 0);

    let pending = store.pending_uploads().unwrap();
    assert_eq!(pending, vec![ticket.clone()]);

    assert_eq!(store.record_upload_attempt(ticket.id).unwrap(), 1);
    assert!(store.complete_upload(ticket.id).unwrap());
    assert!(!store.complete_upload(ticket.id).unwrap());
    assert!(store.pending_uploads().unwrap().is_empty());
}

#[test]
fn enqueue_for_unknown_record_fails() {
    let store = LocalStore::open_in_memory().unwrap();
    let err = store.enqueue_upload(LocalId::new(5), "/tmp/x.jpg").unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[test]
fn record_attempt_for_unknown_ticket_fails() {
    let store = LocalStore::open_in_memory().unwrap();
    assert!(matches!(store.record_upload_attempt(3).unwrap_err(), StorageError::NotFound(_)));
}

#[test]
fn uploads_follow_their_record_out_of_the_store() {
    let store = LocalStore::open_in_memory().unwrap();
    let photo = store.create(EntityKind::Attachment, json!({"kind": "photo"})).unwrap();
    let create = store.drain_log(1).unwrap().remove(0);
    store.complete_create(create.id, &ServerId::new("att-1")).unwrap();
    store.enqueue_upload(photo.local_id, "/data/p.jpg").unwrap();

    store.delete(EntityKind::Attachment, photo.local_id).unwrap();
    let delete = store.drain_log(1).unwrap().remove(0);
    store.acknowledge(delete.id).unwrap();

    assert!(store.pending_uploads().unwrap().is_empty());
}
