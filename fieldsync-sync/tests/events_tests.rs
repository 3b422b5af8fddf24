use fieldsync_sync::{EventBus, SyncEvent};
use fieldsync_types::Timestamp;
use std::sync::{Arc, Mutex};

#[test]
fn listeners_run_in_registration_order() {
    let bus = EventBus::<u32>::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        bus.add_listener(move |_| order.lock().unwrap().push(tag));
    }

    assert_eq!(bus.notify(&7), 3);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn panicking_listener_is_skipped() {
    let bus = EventBus::<u32>::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.add_listener(|_| panic!("boom"));
    let sink = Arc::clone(&seen);
    bus.add_listener(move |v| sink.lock().unwrap().push(*v));

    assert_eq!(bus.notify(&1), 1);
    assert_eq!(bus.notify(&2), 1);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(bus.listener_count(), 2);
}

#[test]
fn remove_listener_returns_whether_it_existed() {
    let bus = EventBus::<()>::new();
    let a = bus.add_listener(|_| {});
    let b = bus.add_listener(|_| {});
    assert_ne!(a, b);

    assert!(bus.remove_listener(a));
    assert!(!bus.remove_listener(a));
    assert_eq!(bus.listener_count(), 1);
    assert_eq!(bus.notify(&()), 1);
}

#[test]
fn listener_may_unsubscribe_itself() {
    let bus = Arc::new(EventBus::<u32>::new());
    let slot = Arc::new(Mutex::new(None));
    let calls = Arc::new(Mutex::new(0));

    let bus_ref = Arc::clone(&bus);
    let slot_ref = Arc::clone(&slot);
    let calls_ref = Arc::clone(&calls);
    let id = bus.add_listener(move |_| {
        *calls_ref.lock().unwrap() += 1;
        if let Some(id) = *slot_ref.lock().unwrap() {
            bus_ref.remove_listener(id);
        }
    });
    *slot.lock().unwrap() = Some(id);

    bus.notify(&1);
    bus.notify(&2);
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn sync_event_serializes_with_type_tag() {
    let event = SyncEvent::SyncProgress { completed: 3, total: 10 };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "sync_progress");
    assert_eq!(json["completed"], 3);

    let event = SyncEvent::SyncError {
        error: "server returned 500: boom".into(),
        auth_required: false,
        timestamp: Timestamp::from_millis(1_000),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "sync_error");
    assert_eq!(json["timestamp"], 1_000);
}
