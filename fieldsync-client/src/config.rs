//! Process-level configuration.

use anyhow::{ensure, Context, Result};
use fieldsync_sync::{ConnectivityConfig, GatewayConfig, SyncConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything a host needs to bring FieldSync up.
///
/// Missing fields take their defaults, so a host file only names what it
/// changes:
///
/// ```json
/// { "database_path": "/data/fieldsync.db", "gateway": { "base_url": "https://api.example.com/v1" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub database_path: PathBuf,
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    pub log_filter: String,
    /// Bearer token installed on the HTTP gateway at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub gateway: GatewayConfig,
    pub sync: SyncConfig,
    pub connectivity: ConnectivityConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("fieldsync.db"),
            log_filter: "info".to_string(),
            auth_token: None,
            gateway: GatewayConfig::default(),
            sync: SyncConfig::default(),
            connectivity: ConnectivityConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid client configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("Failed to load {}", path.display()))
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.sync.batch_size > 0, "sync.batch_size must be positive");
        ensure!(self.sync.max_retries > 0, "sync.max_retries must be positive");
        ensure!(
            !self.sync.entity_kinds.is_empty(),
            "sync.entity_kinds must name at least one kind"
        );
        ensure!(
            !self.gateway.base_url.trim().is_empty(),
            "gateway.base_url must not be empty"
        );
        Ok(())
    }
}
