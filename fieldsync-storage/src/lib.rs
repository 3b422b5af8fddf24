//! SQLite storage layer for FieldSync.
//!
//! Provides the local durable store: domain records, the operation log of
//! pending mutations, scalar sync metadata and the deferred upload queue.
//!
//! # Architecture
//!
//! - Records are stored as JSON payloads keyed by a local rowid, with the
//!   offline id and server id alongside
//! - Every mutating write appends an operation log entry in the same
//!   transaction, so the log never disagrees with record state
//! - Pulled server copies are reconciled through [`ConflictStrategy`]
//! - The schema is created idempotently on open

pub mod conflict;
mod error;
mod local_store;
mod upload_queue;

pub use conflict::{conflicting_fields, resolve_conflict, ConflictStrategy};
pub use error::{StorageError, StorageResult};
pub use local_store::{DeleteOutcome, FailureOutcome, LocalStore, MergeOutcome};
pub use upload_queue::UploadTicket;

use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a SQLite connection configured for the local store.
///
/// Creates the parent directory if needed and switches the database to WAL
/// journaling, which keeps readers unblocked while the sync engine writes.
pub fn open_sqlite(path: &Path) -> StorageResult<rusqlite::Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    debug!("Opened local store at {} (journal_mode={})", path.display(), mode);
    Ok(conn)
}
