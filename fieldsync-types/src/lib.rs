//! Core type definitions for FieldSync.
//!
//! This crate defines the storage-agnostic types shared by the local store
//! and the sync engine:
//! - Record identifiers (local rowid, offline UUID v7, server-assigned id)
//! - Millisecond timestamps
//! - Domain records and their sync status
//! - Operation log entries (pending mutations awaiting a remote ack)
//!
//! Domain payloads (work order fields, customer addresses, ...) are opaque
//! JSON objects here. Their shape belongs to the host application.

mod ids;
mod operation;
mod record;
mod timestamp;

pub use ids::{LocalId, OfflineId, OperationId, ServerId};
pub use operation::{Action, OperationLogEntry, MAX_RETRIES};
pub use record::{EntityKind, Record, RemoteRecord, SyncStatus};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("unknown entity kind: {0}")]
    UnknownEntityKind(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown sync status: {0}")]
    UnknownSyncStatus(String),
}
