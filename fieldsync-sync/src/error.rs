//! Error types for the sync layer.

use crate::gateway::GatewayError;
use fieldsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Remote gateway failure.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// A blocking store task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Whether the failure means the user must re-authenticate.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Gateway(e) if e.is_auth())
    }
}
