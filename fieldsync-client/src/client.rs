//! Lifecycle of one FieldSync instance.

use crate::config::ClientConfig;
use anyhow::{bail, Context, Result};
use fieldsync_storage::LocalStore;
use fieldsync_sync::{
    ConnectivityMonitor, HttpGateway, RemoteGateway, SyncEngine, SyncOutcome, SyncStatusSnapshot,
};
use std::sync::Arc;
use tracing::info;

/// One store, one connectivity monitor and one engine, owned together.
///
/// Must be created inside a tokio runtime: [`init`](Self::init) starts the
/// debounce and background sync tasks.
pub struct FieldSyncClient {
    store: Arc<LocalStore>,
    connectivity: ConnectivityMonitor,
    engine: Arc<SyncEngine>,
    http: Option<Arc<HttpGateway>>,
}

impl FieldSyncClient {
    /// Brings FieldSync up against the REST backend named in `config`.
    pub async fn init(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let http = Arc::new(
            HttpGateway::new(config.gateway.clone()).context("Failed to build HTTP gateway")?,
        );
        http.set_token(config.auth_token.clone()).await;

        let mut client = Self::with_gateway(config, Arc::clone(&http) as Arc<dyn RemoteGateway>).await?;
        client.http = Some(http);
        Ok(client)
    }

    /// Brings FieldSync up against any gateway.
    pub async fn with_gateway(config: ClientConfig, gateway: Arc<dyn RemoteGateway>) -> Result<Self> {
        config.validate()?;
        crate::init_logging(&config.log_filter);

        let path = config.database_path.clone();
        let store = tokio::task::spawn_blocking(move || LocalStore::open(&path))
            .await
            .context("Store open task failed")?
            .with_context(|| format!("Failed to open store at {}", config.database_path.display()))?;
        let store = Arc::new(store);

        let connectivity = ConnectivityMonitor::new(config.connectivity.clone());
        let engine = Arc::new(
            SyncEngine::new(
                Arc::clone(&store),
                gateway,
                connectivity.clone(),
                config.sync.clone(),
            )
            .context("Failed to create sync engine")?,
        );
        engine.start();

        info!(
            "FieldSync ready (db={}, pending={})",
            config.database_path.display(),
            engine.get_sync_status().pending_operations
        );
        Ok(Self {
            store,
            connectivity,
            engine,
            http: None,
        })
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Feeds a raw reachability report to the monitor.
    pub fn report_connectivity(&self, online: bool) {
        self.connectivity.report(online);
    }

    /// Replaces the bearer token used by the HTTP gateway.
    pub async fn set_auth_token(&self, token: Option<String>) -> Result<()> {
        let Some(http) = &self.http else {
            bail!("No HTTP gateway configured");
        };
        http.set_token(token).await;
        Ok(())
    }

    /// Runs a cycle now, ignoring the throttle.
    pub async fn sync_now(&self) -> SyncOutcome {
        self.engine.sync_all(true).await
    }

    pub fn status(&self) -> SyncStatusSnapshot {
        self.engine.get_sync_status()
    }

    /// Stops background work. The store closes when the last handle drops.
    pub fn dispose(self) {
        self.engine.shutdown();
        self.connectivity.shutdown();
        info!("FieldSync disposed");
    }
}
