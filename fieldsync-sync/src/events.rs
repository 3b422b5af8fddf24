//! Listener registry for sync and connectivity notifications.
//!
//! Delivery is synchronous and in registration order. A listener that
//! panics is logged and skipped; the remaining listeners still run.

use fieldsync_types::Timestamp;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::error;

/// Handle returned by [`EventBus::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Notifications emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStart {
        forced: bool,
    },
    SyncProgress {
        completed: usize,
        total: usize,
    },
    SyncComplete {
        uploaded: usize,
        downloaded: usize,
        failed: usize,
        timestamp: Timestamp,
    },
    SyncError {
        error: String,
        auth_required: bool,
        timestamp: Timestamp,
    },
    Connectivity {
        online: bool,
    },
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered set of callbacks for one event type.
pub struct EventBus<E> {
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener<E>)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the listener was already removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Delivers an event to every listener. Returns how many returned
    /// without panicking.
    pub fn notify(&self, event: &E) -> usize {
        // Snapshot so listeners may add or remove listeners while running.
        let snapshot: Vec<_> = self.listeners().iter().map(|(id, l)| (*id, Arc::clone(l))).collect();
        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!("Event listener {:?} panicked", id),
            }
        }
        delivered
    }
}
