use fieldsync_types::{LocalId, OfflineId, OperationId, ServerId};
use std::collections::HashSet;
use std::str::FromStr;

// ── OfflineId ────────────────────────────────────────────────────

#[test]
fn offline_id_new_is_unique() {
    let a = OfflineId::new();
    let b = OfflineId::new();
    assert_ne!(a, b);
}

#[test]
fn offline_id_from_uuid_roundtrip() {
    let uuid = uuid::Uuid::now_v7();
    let id = OfflineId::from_uuid(uuid);
    assert_eq!(id.as_uuid(), uuid);
}

#[test]
fn offline_id_display_and_parse() {
    let id = OfflineId::new();
    let parsed = OfflineId::parse(&id.to_string()).unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn offline_id_from_str_invalid() {
    assert!(OfflineId::from_str("garbage").is_err());
}

#[test]
fn offline_ids_sort_by_creation() {
    let a = OfflineId::new();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let b = OfflineId::new();
    assert!(a.as_uuid() < b.as_uuid());
}

#[test]
fn offline_id_serializes_as_plain_string() {
    let id = OfflineId::new();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
}

// ── ServerId ─────────────────────────────────────────────────────

#[test]
fn server_id_from_str_and_string() {
    let a = ServerId::from("42");
    let b = ServerId::from("42".to_string());
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "42");
    assert_eq!(a.to_string(), "42");
}

#[test]
fn server_id_hash_and_eq() {
    let mut set = HashSet::new();
    set.insert(ServerId::new("wo-1"));
    set.insert(ServerId::new("wo-1"));
    assert_eq!(set.len(), 1);
}

// ── LocalId / OperationId ────────────────────────────────────────

#[test]
fn local_id_ordering_and_display() {
    assert!(LocalId::new(1) < LocalId::new(2));
    assert_eq!(LocalId::new(7).get(), 7);
    assert_eq!(LocalId::new(7).to_string(), "7");
}

#[test]
fn operation_id_display_has_hash_prefix() {
    assert_eq!(OperationId::new(12).to_string(), "#12");
    assert!(OperationId::new(3) < OperationId::new(4));
}
