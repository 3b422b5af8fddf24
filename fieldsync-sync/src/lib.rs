//! Offline-first sync engine for FieldSync.
//!
//! Local writes land in the [`LocalStore`](fieldsync_storage::LocalStore)
//! together with an operation log entry. The engine drains that log to the
//! backend, pulls authoritative records back and reconciles them.
//!
//! # Components
//!
//! - **Gateway**: [`RemoteGateway`] abstracts the backend API; [`HttpGateway`]
//!   is the REST binding
//! - **Connectivity**: [`ConnectivityMonitor`] debounces raw reachability
//! - **Events**: [`EventBus`] delivers [`SyncEvent`]s to host listeners
//! - **Engine**: [`SyncEngine`] runs push → pull → reconcile cycles
//!
//! # Cycle
//!
//! 1. **Push**: queued entries grouped per record, CREATE before UPDATE
//!    before DELETE. A failure defers that record's later entries to the
//!    next cycle without blocking other records
//! 2. **Pull**: every configured entity kind is fetched
//! 3. **Reconcile**: server copies are merged per [`ConflictStrategy`]
//!
//! # Example
//!
//! ```
//! use fieldsync_storage::LocalStore;
//! use fieldsync_sync::mock::MockGateway;
//! use fieldsync_sync::{ConnectivityConfig, ConnectivityMonitor, SyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! let store = Arc::new(LocalStore::open_in_memory().unwrap());
//! let monitor = ConnectivityMonitor::new(ConnectivityConfig::default());
//! let engine = SyncEngine::new(store, Arc::new(MockGateway::new()), monitor, SyncConfig::default()).unwrap();
//! assert!(!engine.is_syncing());
//! ```

pub mod connectivity;
mod engine;
mod error;
pub mod events;
pub mod gateway;
pub mod http;
pub mod state;

pub use connectivity::{ConnectivityConfig, ConnectivityMonitor, ConnectivityState};
pub use engine::{order_for_push, SyncConfig, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, ListenerId, SyncEvent};
pub use fieldsync_storage::{resolve_conflict, ConflictStrategy};
pub use gateway::{mock, BatchOperation, BatchOutcome, BatchResult, GatewayError, RemoteGateway};
pub use http::{GatewayConfig, HttpGateway};
pub use state::{SkipReason, SyncOutcome, SyncPhase, SyncSession, SyncStatusSnapshot};
