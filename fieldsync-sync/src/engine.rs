//! Sync engine: push the operation log, pull server state, reconcile.
//!
//! At most one cycle runs at a time. A cycle is skipped while offline and,
//! unless forced, while inside the minimum interval after the last success.
//! Store calls run on the blocking pool so the runtime never waits on SQLite.

use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, ListenerId, SyncEvent};
use crate::gateway::{BatchOperation, BatchOutcome, GatewayError, RemoteGateway};
use crate::state::{PhaseCell, SkipReason, SyncOutcome, SyncPhase, SyncSession, SyncStatusSnapshot};
use fieldsync_storage::{ConflictStrategy, FailureOutcome, LocalStore, StorageError, StorageResult};
use fieldsync_types::{
    Action, EntityKind, LocalId, OperationId, OperationLogEntry, RemoteRecord, ServerId, Timestamp,
    MAX_RETRIES,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum log entries pushed per cycle.
    pub batch_size: usize,
    /// Failed attempts before an entry is abandoned.
    pub max_retries: u32,
    /// Period of the background sync (s). Zero disables it.
    pub auto_sync_interval_secs: u64,
    /// Unforced cycles inside this window after a success are skipped (s).
    pub min_sync_interval_secs: u64,
    pub conflict_strategy: ConflictStrategy,
    /// Retry 4xx rejections like transient failures instead of abandoning.
    pub retry_client_errors: bool,
    /// Push through [`RemoteGateway::sync_batch`] when the gateway has it.
    pub batch_push: bool,
    /// Kinds pulled each cycle, in order.
    pub entity_kinds: Vec<EntityKind>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: MAX_RETRIES,
            auto_sync_interval_secs: 300,
            min_sync_interval_secs: 0,
            conflict_strategy: ConflictStrategy::Merge,
            retry_client_errors: false,
            batch_push: false,
            entity_kinds: EntityKind::ALL.to_vec(),
        }
    }
}

/// Orders a drained log for dispatch.
///
/// Entries are grouped by record, groups keep the order in which their
/// first entry was queued, and within a group CREATE precedes UPDATE
/// precedes DELETE with ties broken by queue order.
pub fn order_for_push(entries: Vec<OperationLogEntry>) -> Vec<OperationLogEntry> {
    let mut groups: Vec<Vec<OperationLogEntry>> = Vec::new();
    let mut index: HashMap<(EntityKind, LocalId), usize> = HashMap::new();
    for entry in entries {
        let slot = *index.entry(entry.entity_key()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(entry);
    }
    groups
        .into_iter()
        .flat_map(|mut group| {
            group.sort_by_key(|e| (e.action.rank(), e.id));
            group
        })
        .collect()
}

/// Why one entry could not be pushed.
enum PushError {
    /// The gateway failed or refused the call.
    Remote(GatewayError),
    /// The record is not in a state that can be sent yet.
    NotReady(String),
    /// The local store failed; the cycle stops.
    Local(SyncError),
}

impl From<GatewayError> for PushError {
    fn from(e: GatewayError) -> Self {
        PushError::Remote(e)
    }
}

impl From<SyncError> for PushError {
    fn from(e: SyncError) -> Self {
        PushError::Local(e)
    }
}

/// Clears the in-flight flag when the cycle ends, however it ends.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// The sync engine.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    gateway: Arc<dyn RemoteGateway>,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    syncing: AtomicBool,
    phase: PhaseCell,
    last_sync: Mutex<Option<Timestamp>>,
    events: EventBus<SyncEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connectivity_listener: Mutex<Option<ListenerId>>,
}

impl SyncEngine {
    /// Creates an engine. The last sync time is read from the store.
    pub fn new(
        store: Arc<LocalStore>,
        gateway: Arc<dyn RemoteGateway>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let last_sync = store.last_sync_time()?;
        Ok(Self {
            store,
            gateway,
            connectivity,
            config,
            syncing: AtomicBool::new(false),
            phase: PhaseCell::new(),
            last_sync: Mutex::new(last_sync),
            events: EventBus::new(),
            tasks: Mutex::new(Vec::new()),
            connectivity_listener: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn last_sync_time(&self) -> Option<Timestamp> {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    pub fn get_sync_status(&self) -> SyncStatusSnapshot {
        let pending_operations = self.store.pending_count().unwrap_or_else(|e| {
            warn!("Failed to count pending operations: {}", e);
            0
        });
        SyncStatusSnapshot {
            is_syncing: self.is_syncing(),
            is_online: self.connectivity.is_online(),
            phase: self.phase.get(),
            last_sync_time: self.last_sync_time(),
            pending_operations,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Starts the periodic sync and the reconnect trigger.
    ///
    /// Must be called inside a Tokio runtime. A second call is a no-op
    /// until [`SyncEngine::shutdown`].
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut listener = self
            .connectivity_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return;
        }

        self.connectivity.start();
        let handle = Handle::current();
        let weak = Arc::downgrade(self);
        *listener = Some(self.connectivity.on_transition(move |state| {
            if let Some(engine) = weak.upgrade() {
                engine.on_connectivity(state, &handle);
            }
        }));

        if self.config.auto_sync_interval_secs > 0 {
            let period = Duration::from_secs(self.config.auto_sync_interval_secs);
            tasks.push(tokio::spawn(auto_sync_loop(Arc::downgrade(self), period)));
        }
        info!(
            "Sync engine started (auto sync every {}s)",
            self.config.auto_sync_interval_secs
        );
    }

    /// Stops background work. A cycle already running finishes on its own.
    pub fn shutdown(&self) {
        if let Some(id) = self
            .connectivity_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.connectivity.remove_listener(id);
        }
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        info!("Sync engine stopped");
    }

    fn on_connectivity(self: Arc<Self>, state: &ConnectivityState, handle: &Handle) {
        self.events.notify(&SyncEvent::Connectivity {
            online: state.is_online,
        });
        if !state.is_online {
            return;
        }
        let settle = self.connectivity.settle_delay();
        let weak = Arc::downgrade(&self);
        let task = handle.spawn(async move {
            tokio::time::sleep(settle).await;
            let Some(engine) = weak.upgrade() else {
                return;
            };
            if !engine.connectivity.is_online() {
                debug!("Link dropped during settle delay, skipping reconnect sync");
                return;
            }
            let outcome = engine.sync_all(false).await;
            debug!("Reconnect sync finished: {:?}", outcome);
        });
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    // ── Cycle ────────────────────────────────────────────────────

    /// Runs one push/pull/reconcile cycle.
    ///
    /// `force` bypasses only the minimum interval; a cycle is never started
    /// while another runs or while offline.
    pub async fn sync_all(&self, force: bool) -> SyncOutcome {
        let Some(_guard) = CycleGuard::acquire(&self.syncing) else {
            debug!("Sync requested while a cycle is running");
            return SyncOutcome::Skipped {
                reason: SkipReason::AlreadySyncing,
            };
        };
        if !self.connectivity.is_online() {
            debug!("Sync skipped: offline");
            return SyncOutcome::Skipped {
                reason: SkipReason::Offline,
            };
        }
        if !force && self.throttled() {
            debug!("Sync skipped: inside minimum interval");
            return SyncOutcome::Skipped {
                reason: SkipReason::Throttled,
            };
        }

        let mut session = SyncSession::new(force);
        info!("Sync cycle started (forced: {})", force);
        self.events.notify(&SyncEvent::SyncStart { forced: force });

        let result = self.run_cycle(&mut session).await;
        self.phase.set(SyncPhase::Idle);

        match result {
            Ok(timestamp) => {
                info!(
                    "Sync cycle complete: {} uploaded, {} downloaded, {} failed",
                    session.uploaded_count, session.downloaded_count, session.failed_count
                );
                self.events.notify(&SyncEvent::SyncComplete {
                    uploaded: session.uploaded_count,
                    downloaded: session.downloaded_count,
                    failed: session.failed_count,
                    timestamp,
                });
                SyncOutcome::Completed {
                    uploaded: session.uploaded_count,
                    downloaded: session.downloaded_count,
                    failed: session.failed_count,
                    timestamp,
                }
            }
            Err(e) => {
                let timestamp = Timestamp::now();
                let auth_required = e.is_auth();
                let error = session.error.insert(e.to_string()).clone();
                warn!(
                    "Sync cycle failed after {} uploads: {}",
                    session.uploaded_count, error
                );
                self.events.notify(&SyncEvent::SyncError {
                    error: error.clone(),
                    auth_required,
                    timestamp,
                });
                SyncOutcome::Failed {
                    error,
                    auth_required,
                    timestamp,
                }
            }
        }
    }

    fn throttled(&self) -> bool {
        let min_interval = self.config.min_sync_interval_secs.saturating_mul(1_000);
        min_interval > 0
            && self
                .last_sync_time()
                .is_some_and(|last| Timestamp::now().millis_since(last) < min_interval)
    }

    async fn run_cycle(&self, session: &mut SyncSession) -> SyncResult<Timestamp> {
        self.phase.set(SyncPhase::Pushing);
        self.push(session).await?;

        self.phase.set(SyncPhase::Pulling);
        let pulled = self.pull().await?;

        self.phase.set(SyncPhase::Reconciling);
        self.reconcile(pulled, session).await?;

        let timestamp = Timestamp::now();
        self.with_store(move |store| store.set_last_sync_time(timestamp)).await?;
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(timestamp);
        Ok(timestamp)
    }

    async fn with_store<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&LocalStore) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
            .map_err(SyncError::from)
    }

    // ── Push ─────────────────────────────────────────────────────

    async fn push(&self, session: &mut SyncSession) -> SyncResult<()> {
        let limit = self.config.batch_size;
        let entries = self.with_store(move |store| store.drain_log(limit)).await?;
        if entries.is_empty() {
            return Ok(());
        }
        let ordered = order_for_push(entries);
        debug!("Pushing {} queued operations", ordered.len());

        if self.config.batch_push {
            match self.push_batch(&ordered, session).await {
                Err(SyncError::Gateway(GatewayError::Unsupported(_))) => {
                    debug!("Gateway has no batch endpoint, pushing individually");
                }
                other => return other,
            }
        }
        self.push_each(ordered, session).await
    }

    async fn push_each(&self, ordered: Vec<OperationLogEntry>, session: &mut SyncSession) -> SyncResult<()> {
        let total = ordered.len();
        // Records with a failed entry this cycle; their later entries wait.
        let mut blocked: HashSet<(EntityKind, LocalId)> = HashSet::new();

        for (index, entry) in ordered.into_iter().enumerate() {
            let key = entry.entity_key();
            if blocked.contains(&key) {
                debug!("Deferring {} {}: earlier operation failed", entry.action, entry.id);
            } else {
                let result = self.push_entry(&entry).await;
                self.record_result(entry.id, key, result, &mut blocked, session).await?;
            }
            self.events.notify(&SyncEvent::SyncProgress {
                completed: index + 1,
                total,
            });
        }
        Ok(())
    }

    /// Books one push attempt. A failure blocks the record's later entries
    /// for the rest of the cycle; auth and local errors end the cycle.
    async fn record_result(
        &self,
        entry_id: OperationId,
        key: (EntityKind, LocalId),
        result: Result<(), PushError>,
        blocked: &mut HashSet<(EntityKind, LocalId)>,
        session: &mut SyncSession,
    ) -> SyncResult<()> {
        match result {
            Ok(()) => {
                session.uploaded_count += 1;
                Ok(())
            }
            Err(PushError::Remote(e)) if e.is_auth() => {
                warn!("Push stopped, authentication required: {}", e);
                Err(e.into())
            }
            Err(PushError::Local(e)) => Err(e),
            Err(PushError::Remote(e)) => {
                blocked.insert(key);
                session.failed_count += 1;
                self.handle_rejection(entry_id, &e).await
            }
            Err(PushError::NotReady(reason)) => {
                blocked.insert(key);
                session.failed_count += 1;
                self.count_failure(entry_id, reason).await
            }
        }
    }

    async fn push_entry(&self, entry: &OperationLogEntry) -> Result<(), PushError> {
        let entry_id = entry.id;
        let kind = entry.entity_kind;
        let lookup = entry.clone();
        let Some(record) = self.with_store(move |store| store.record_for_entry(&lookup)).await? else {
            warn!("Dropping {} {}: {} {} no longer exists", entry.action, entry_id, kind, entry.entity_local_id);
            return self.settle(entry_id, move |store| store.acknowledge(entry_id)).await;
        };

        match entry.action {
            Action::Create => {
                if record.server_id.is_some() {
                    // Linked by an earlier pull or a lost ack.
                    debug!("{} {} already on server, acknowledging CREATE", kind, record.local_id);
                    return self.settle(entry_id, move |store| store.acknowledge(entry_id)).await;
                }
                let remote = self.gateway.create(kind, record.offline_id, &entry.payload).await?;
                self.settle(entry_id, move |store| store.complete_create(entry_id, &remote.server_id))
                    .await
            }
            Action::Update => {
                let server_id = record
                    .server_id
                    .ok_or_else(|| PushError::NotReady(format!("{kind} {} has no server id", record.local_id)))?;
                self.gateway.update(kind, &server_id, &entry.payload).await?;
                self.settle(entry_id, move |store| store.acknowledge(entry_id)).await
            }
            Action::Delete => {
                let server_id = record
                    .server_id
                    .ok_or_else(|| PushError::NotReady(format!("{kind} {} has no server id", record.local_id)))?;
                match self.gateway.delete(kind, &server_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => debug!("{} {} already gone on server", kind, server_id),
                    Err(e) => return Err(e.into()),
                }
                self.settle(entry_id, move |store| store.acknowledge(entry_id)).await
            }
        }
    }

    /// Applies a post-push store update. An entry removed concurrently by a
    /// local write is not an error.
    async fn settle<F>(&self, entry_id: OperationId, f: F) -> Result<(), PushError>
    where
        F: FnOnce(&LocalStore) -> StorageResult<()> + Send + 'static,
    {
        match self.with_store(f).await {
            Ok(()) => Ok(()),
            Err(SyncError::Storage(StorageError::NotFound(what))) => {
                warn!("Entry {} vanished before it was settled ({})", entry_id, what);
                Ok(())
            }
            Err(e) => Err(PushError::Local(e)),
        }
    }

    async fn handle_rejection(&self, entry_id: OperationId, error: &GatewayError) -> SyncResult<()> {
        if error.is_retryable() || self.config.retry_client_errors {
            return self.count_failure(entry_id, error.to_string()).await;
        }
        let message = error.to_string();
        self.with_store(move |store| store.abandon(entry_id, &message)).await
    }

    async fn count_failure(&self, entry_id: OperationId, message: String) -> SyncResult<()> {
        let max_retries = self.config.max_retries;
        let outcome = self
            .with_store(move |store| store.record_failure(entry_id, &message, max_retries))
            .await?;
        if let FailureOutcome::Retrying { retry_count } = outcome {
            debug!("Entry {} will be retried (attempt {} of {})", entry_id, retry_count, max_retries);
        }
        Ok(())
    }

    async fn push_batch(&self, ordered: &[OperationLogEntry], session: &mut SyncSession) -> SyncResult<()> {
        let lookups = ordered.to_vec();
        let records = self
            .with_store(move |store| {
                lookups
                    .iter()
                    .map(|entry| store.record_for_entry(entry))
                    .collect::<StorageResult<Vec<_>>>()
            })
            .await?;

        let mut operations = Vec::with_capacity(ordered.len());
        let mut keys = Vec::with_capacity(ordered.len());
        let mut orphaned = Vec::new();
        for (entry, record) in ordered.iter().zip(records) {
            match record {
                Some(record) => {
                    keys.push(entry.entity_key());
                    operations.push(BatchOperation {
                        op_id: entry.id,
                        action: entry.action,
                        entity_kind: entry.entity_kind,
                        offline_id: record.offline_id,
                        server_id: record.server_id,
                        payload: entry.payload.clone(),
                    });
                }
                None => orphaned.push(entry.id),
            }
        }
        if operations.is_empty() {
            return self.drop_orphans(orphaned).await;
        }

        let mut blocked: HashSet<(EntityKind, LocalId)> = HashSet::new();
        let results = match self.gateway.sync_batch(&operations).await {
            Ok(results) => results,
            Err(e) if e.is_auth() || matches!(e, GatewayError::Unsupported(_)) => return Err(e.into()),
            Err(e) => {
                warn!("Batch push failed: {}", e);
                for (op, key) in operations.iter().zip(keys) {
                    if blocked.contains(&key) {
                        continue;
                    }
                    self.record_result(op.op_id, key, Err(PushError::Remote(e.clone())), &mut blocked, session)
                        .await?;
                }
                return self.drop_orphans(orphaned).await;
            }
        };
        self.drop_orphans(orphaned).await?;

        let mut outcomes: HashMap<OperationId, BatchOutcome> =
            results.into_iter().map(|r| (r.op_id, r.outcome)).collect();
        let total = operations.len();
        for (index, (op, key)) in operations.into_iter().zip(keys).enumerate() {
            let outcome = outcomes.remove(&op.op_id);
            if blocked.contains(&key) {
                // Resent once the earlier failure clears.
                debug!("Deferring {} {}: earlier operation failed", op.action, op.op_id);
            } else {
                let result = match outcome {
                    Some(BatchOutcome::Applied { server_id }) => self.settle_applied(&op, server_id).await,
                    Some(BatchOutcome::Rejected { status, message }) => {
                        Err(PushError::Remote(GatewayError::from_status(status, message)))
                    }
                    None => Err(PushError::NotReady("missing from batch response".to_string())),
                };
                self.record_result(op.op_id, key, result, &mut blocked, session).await?;
            }
            self.events.notify(&SyncEvent::SyncProgress {
                completed: index + 1,
                total,
            });
        }
        Ok(())
    }

    async fn settle_applied(&self, op: &BatchOperation, server_id: Option<ServerId>) -> Result<(), PushError> {
        let entry_id = op.op_id;
        match (op.action, &op.server_id, server_id) {
            (Action::Create, None, Some(server_id)) => {
                self.settle(entry_id, move |store| store.complete_create(entry_id, &server_id))
                    .await
            }
            (Action::Create, None, None) => Err(PushError::Remote(GatewayError::InvalidResponse(
                "applied CREATE carries no server id".to_string(),
            ))),
            _ => self.settle(entry_id, move |store| store.acknowledge(entry_id)).await,
        }
    }

    /// Acknowledges entries whose record no longer exists.
    async fn drop_orphans(&self, orphaned: Vec<OperationId>) -> SyncResult<()> {
        for entry_id in orphaned {
            warn!("Dropping entry {}: its record no longer exists", entry_id);
            if let Err(PushError::Local(e)) = self.settle(entry_id, move |store| store.acknowledge(entry_id)).await {
                return Err(e);
            }
        }
        Ok(())
    }

    // ── Pull ─────────────────────────────────────────────────────

    async fn pull(&self) -> SyncResult<Vec<(EntityKind, Vec<RemoteRecord>)>> {
        let mut pulled = Vec::with_capacity(self.config.entity_kinds.len());
        for kind in &self.config.entity_kinds {
            let records = self.gateway.fetch_all(*kind).await?;
            debug!("Pulled {} {} records", records.len(), kind);
            pulled.push((*kind, records));
        }
        Ok(pulled)
    }

    async fn reconcile(
        &self,
        pulled: Vec<(EntityKind, Vec<RemoteRecord>)>,
        session: &mut SyncSession,
    ) -> SyncResult<()> {
        let strategy = self.config.conflict_strategy;
        for (kind, records) in pulled {
            let downloaded = self
                .with_store(move |store| {
                    let mut downloaded = 0;
                    for remote in &records {
                        match store.merge_remote(kind, remote, strategy) {
                            Ok(outcome) if outcome.is_download() => downloaded += 1,
                            Ok(_) => {}
                            Err(StorageError::InvalidData(reason)) => {
                                warn!("Skipping {} {}: {}", kind, remote.server_id, reason);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(downloaded)
                })
                .await?;
            session.downloaded_count += downloaded;
        }
        Ok(())
    }
}

async fn auto_sync_loop(engine: Weak<SyncEngine>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        if engine.is_syncing() || !engine.connectivity.is_online() {
            debug!("Skipping scheduled sync");
            continue;
        }
        let outcome = engine.sync_all(false).await;
        debug!("Scheduled sync finished: {:?}", outcome);
    }
}
