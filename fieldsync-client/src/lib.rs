//! Host-facing entry point for FieldSync.
//!
//! [`FieldSyncClient`] owns one store, one connectivity monitor and one
//! engine. Hosts create it with [`FieldSyncClient::init`], feed it
//! reachability reports and release it with [`FieldSyncClient::dispose`].

mod client;
mod config;

pub use client::FieldSyncClient;
pub use config::ClientConfig;

pub use fieldsync_storage::{ConflictStrategy, LocalStore};
pub use fieldsync_sync::{
    ConnectivityConfig, GatewayConfig, RemoteGateway, SyncConfig, SyncEvent, SyncOutcome,
    SyncStatusSnapshot,
};
pub use fieldsync_types::{EntityKind, LocalId, Record};

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `filter`; an unparsable filter falls back
/// to `info`. Returns false if a subscriber was already installed.
pub fn init_logging(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
