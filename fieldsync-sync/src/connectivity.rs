//! Debounced network reachability.
//!
//! Hosts feed raw platform signals through [`ConnectivityMonitor::report`].
//! A change is committed only after the raw signal has been stable for the
//! debounce window, so a flapping link produces at most one transition.

use crate::events::{EventBus, ListenerId};
use fieldsync_types::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Committed reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub is_online: bool,
    /// When the last transition was committed.
    pub last_transition_at: Option<Timestamp>,
}

/// Configuration for the connectivity monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Quiet period before a raw change is committed (ms). Zero commits
    /// every report immediately.
    pub debounce_ms: u64,
    /// Pause between coming online and the reconnect sync (ms).
    pub settle_delay_ms: u64,
    /// Assumed state before the first report.
    pub initially_online: bool,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            settle_delay_ms: 2_000,
            initially_online: false,
        }
    }
}

struct Inner {
    config: ConnectivityConfig,
    state: RwLock<ConnectivityState>,
    raw: watch::Sender<bool>,
    transitions: EventBus<ConnectivityState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn current(&self) -> ConnectivityState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, online: bool) {
        let committed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.is_online == online {
                return;
            }
            *state = ConnectivityState {
                is_online: online,
                last_transition_at: Some(Timestamp::now()),
            };
            *state
        };
        info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        self.transitions.notify(&committed);
    }
}

/// Shared handle to the reachability monitor. Clones observe the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    pub fn new(config: ConnectivityConfig) -> Self {
        let (raw, _) = watch::channel(config.initially_online);
        let state = ConnectivityState {
            is_online: config.initially_online,
            last_transition_at: None,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(state),
                raw,
                transitions: EventBus::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Spawns the debounce task. Must be called inside a Tokio runtime.
    /// Calling it again while the task runs is a no-op.
    pub fn start(&self) {
        if self.inner.config.debounce_ms == 0 {
            return;
        }
        let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let window = Duration::from_millis(self.inner.config.debounce_ms);
        let rx = self.inner.raw.subscribe();
        *task = Some(tokio::spawn(debounce_loop(Arc::downgrade(&self.inner), rx, window)));
        debug!("Connectivity monitor started (debounce {:?})", window);
    }

    /// Feeds a raw reachability signal.
    pub fn report(&self, online: bool) {
        self.inner.raw.send_replace(online);
        if self.inner.config.debounce_ms == 0 {
            self.inner.commit(online);
        }
    }

    pub fn current_status(&self) -> ConnectivityState {
        self.inner.current()
    }

    pub fn is_online(&self) -> bool {
        self.inner.current().is_online
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.inner.config.settle_delay_ms)
    }

    /// Registers a callback for committed transitions.
    pub fn on_transition<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectivityState) + Send + Sync + 'static,
    {
        self.inner.transitions.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.transitions.remove_listener(id)
    }

    /// Stops the debounce task. Pending raw changes are dropped.
    pub fn shutdown(&self) {
        let task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = task {
            handle.abort();
            debug!("Connectivity monitor stopped");
        }
    }
}

async fn debounce_loop(inner: Weak<Inner>, mut rx: watch::Receiver<bool>, window: Duration) {
    // A report sent before start() is still pending.
    let mut pending = inner
        .upgrade()
        .is_some_and(|strong| *rx.borrow() != strong.current().is_online);

    loop {
        if !pending && rx.changed().await.is_err() {
            return;
        }
        pending = false;

        // Restart the window on every raw change until it stays quiet.
        loop {
            match tokio::time::timeout(window, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => break,
            }
        }

        let online = *rx.borrow_and_update();
        let Some(strong) = inner.upgrade() else {
            return;
        };
        strong.commit(online);
    }
}
