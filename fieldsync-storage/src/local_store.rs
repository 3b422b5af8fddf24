//! The local durable store.
//!
//! Single writer for records and the operation log. Every public mutation is
//! one SQLite transaction: the record write and its log append commit
//! together or not at all.

use crate::conflict::{conflicting_fields, resolve_conflict, ConflictStrategy};
use crate::error::{StorageError, StorageResult};
use fieldsync_types::{
    Action, EntityKind, LocalId, OfflineId, OperationId, OperationLogEntry, Record, RemoteRecord,
    ServerId, SyncStatus, Timestamp,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        local_id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_kind TEXT NOT NULL,
        server_id TEXT,
        offline_id TEXT NOT NULL UNIQUE,
        payload TEXT NOT NULL,
        sync_status TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_records_kind ON records (entity_kind);

    CREATE UNIQUE INDEX IF NOT EXISTS idx_records_server_id
        ON records (entity_kind, server_id) WHERE server_id IS NOT NULL;

    CREATE TABLE IF NOT EXISTS operation_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        entity_kind TEXT NOT NULL,
        entity_local_id INTEGER NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_operation_log_entity
        ON operation_log (entity_kind, entity_local_id);

    CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS discarded_records (
        entity_kind TEXT NOT NULL,
        offline_id TEXT NOT NULL,
        discarded_at INTEGER NOT NULL,
        PRIMARY KEY (entity_kind, offline_id)
    );

    CREATE TABLE IF NOT EXISTS upload_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_local_id INTEGER NOT NULL,
        file_path TEXT NOT NULL,
        queued_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0
    );
";

const RECORD_COLUMNS: &str =
    "local_id, entity_kind, server_id, offline_id, payload, sync_status, updated_at, deleted";

const ENTRY_COLUMNS: &str =
    "id, action, entity_kind, entity_local_id, payload, created_at, retry_count, last_error";

const LAST_SYNC_KEY: &str = "last_sync_time";

/// Result of a failed push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The entry stays queued for another attempt.
    Retrying { retry_count: u32 },
    /// The entry reached the retry ceiling and was dropped.
    Abandoned { retry_count: u32 },
}

impl FailureOutcome {
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        matches!(self, FailureOutcome::Abandoned { .. })
    }
}

/// Result of a local delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record is tombstoned until the queued DELETE is acknowledged.
    Queued,
    /// The record never reached the server and was removed outright.
    Discarded,
}

/// Result of reconciling one pulled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No local copy existed; a synced record was inserted.
    Inserted(LocalId),
    /// The local copy took server values.
    Updated(LocalId),
    /// Local and server already agreed.
    Unchanged(LocalId),
    /// Local pending state was kept over the server copy.
    Kept(LocalId),
    /// The local copy is awaiting a DELETE push and was left alone.
    SkippedTombstone(LocalId),
}

impl MergeOutcome {
    #[must_use]
    pub fn local_id(&self) -> LocalId {
        match self {
            MergeOutcome::Inserted(id)
            | MergeOutcome::Updated(id)
            | MergeOutcome::Unchanged(id)
            | MergeOutcome::Kept(id)
            | MergeOutcome::SkippedTombstone(id) => *id,
        }
    }

    /// Returns true if local state took any server value.
    #[must_use]
    pub fn is_download(&self) -> bool {
        matches!(self, MergeOutcome::Inserted(_) | MergeOutcome::Updated(_))
    }
}

/// Durable store for records and the operation log, backed by SQLite.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = crate::open_sqlite(path.as_ref())?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    // ── Mutations ────────────────────────────────────────────────

    /// Creates a record and queues its CREATE.
    pub fn create(&self, kind: EntityKind, payload: Value) -> StorageResult<Record> {
        ensure_object(&payload)?;
        let payload_json = serde_json::to_string(&payload)?;
        let offline_id = OfflineId::new();
        let now = Timestamp::now();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO records (entity_kind, server_id, offline_id, payload, sync_status, updated_at, deleted)
             VALUES (?1, NULL, ?2, ?3, ?4, ?5, 0)",
            params![
                kind.as_str(),
                offline_id.to_string(),
                payload_json,
                SyncStatus::Pending.as_str(),
                now.as_millis(),
            ],
        )?;
        let local_id = LocalId::new(tx.last_insert_rowid());
        let entry_id = append_entry(&tx, Action::Create, kind, local_id, &payload_json, now)?;
        tx.commit()?;

        debug!("Created {} {} (offline_id={}, entry {})", kind, local_id, offline_id, entry_id);
        Ok(Record {
            local_id,
            entity_kind: kind,
            server_id: None,
            offline_id,
            payload,
            sync_status: SyncStatus::Pending,
            updated_at: now,
            deleted: false,
        })
    }

    /// Merges a patch into a record and queues an UPDATE.
    ///
    /// Patch fields overwrite payload fields; a `null` patch value removes
    /// the field.
    pub fn update(&self, kind: EntityKind, local_id: LocalId, patch: Value) -> StorageResult<Record> {
        let Value::Object(patch) = patch else {
            return Err(StorageError::InvalidData("patch must be a JSON object".into()));
        };
        let now = Timestamp::now();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut record = load_live_record(&tx, kind, local_id)?;
        apply_patch(&mut record.payload, patch);
        record.sync_status = SyncStatus::Pending;
        record.updated_at = now;
        write_record(&tx, &record)?;
        let payload_json = serde_json::to_string(&record.payload)?;
        let entry_id = append_entry(&tx, Action::Update, kind, local_id, &payload_json, now)?;
        tx.commit()?;

        debug!("Updated {} {} (entry {})", kind, local_id, entry_id);
        Ok(record)
    }

    /// Deletes a record.
    ///
    /// A record the server has never seen is removed together with its
    /// queued entries. Otherwise it is tombstoned and a DELETE is queued.
    ///
    /// A discarded record's offline id is remembered: if its CREATE was
    /// already in flight, the server copy shows up on a later pull and is
    /// turned into a queued DELETE by [`LocalStore::merge_remote`].
    pub fn delete(&self, kind: EntityKind, local_id: LocalId) -> StorageResult<DeleteOutcome> {
        let now = Timestamp::now();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let record = load_live_record(&tx, kind, local_id)?;

        if record.server_id.is_none() {
            tx.execute(
                "DELETE FROM operation_log WHERE entity_kind = ?1 AND entity_local_id = ?2",
                params![kind.as_str(), local_id.get()],
            )?;
            purge_record(&tx, local_id)?;
            tx.execute(
                "INSERT OR REPLACE INTO discarded_records (entity_kind, offline_id, discarded_at)
                 VALUES (?1, ?2, ?3)",
                params![kind.as_str(), record.offline_id.to_string(), now.as_millis()],
            )?;
            tx.commit()?;
            debug!("Discarded local-only {} {}", kind, local_id);
            return Ok(DeleteOutcome::Discarded);
        }

        tx.execute(
            "UPDATE records SET deleted = 1, sync_status = ?1, updated_at = ?2 WHERE local_id = ?3",
            params![SyncStatus::Pending.as_str(), now.as_millis(), local_id.get()],
        )?;
        let payload_json = serde_json::to_string(&record.payload)?;
        append_entry(&tx, Action::Delete, kind, local_id, &payload_json, now)?;
        tx.commit()?;

        debug!("Tombstoned {} {}", kind, local_id);
        Ok(DeleteOutcome::Queued)
    }

    /// Re-queues a record whose earlier push was abandoned.
    pub fn retry_record(&self, kind: EntityKind, local_id: LocalId) -> StorageResult<Record> {
        let now = Timestamp::now();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut record = load_live_record(&tx, kind, local_id)?;
        if record.sync_status != SyncStatus::Error {
            return Ok(record);
        }
        let action = if record.server_id.is_some() {
            Action::Update
        } else {
            Action::Create
        };
        record.sync_status = SyncStatus::Pending;
        record.updated_at = now;
        write_record(&tx, &record)?;
        let payload_json = serde_json::to_string(&record.payload)?;
        append_entry(&tx, action, kind, local_id, &payload_json, now)?;
        tx.commit()?;

        info!("Re-queued {} {} as {}", kind, local_id, action);
        Ok(record)
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Gets a live (non-tombstoned) record.
    pub fn get(&self, kind: EntityKind, local_id: LocalId) -> StorageResult<Option<Record>> {
        let conn = self.conn()?;
        Ok(load_record(&conn, local_id)?.filter(|r| r.entity_kind == kind && !r.deleted))
    }

    /// Gets a record by its server id, tombstones included.
    pub fn find_by_server_id(
        &self,
        kind: EntityKind,
        server_id: &ServerId,
    ) -> StorageResult<Option<Record>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE entity_kind = ?1 AND server_id = ?2"
        );
        let mut records = collect_records(&conn, &sql, params![kind.as_str(), server_id.as_str()])?;
        Ok(records.pop())
    }

    /// Gets the record a log entry targets, tombstones included.
    pub fn record_for_entry(&self, entry: &OperationLogEntry) -> StorageResult<Option<Record>> {
        let conn = self.conn()?;
        Ok(load_record(&conn, entry.entity_local_id)?.filter(|r| r.entity_kind == entry.entity_kind))
    }

    /// Returns live records of a kind that match the predicate, by local id.
    pub fn query<F>(&self, kind: EntityKind, predicate: F) -> StorageResult<Vec<Record>>
    where
        F: Fn(&Record) -> bool,
    {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE entity_kind = ?1 AND deleted = 0 ORDER BY local_id"
        );
        let records = collect_records(&conn, &sql, params![kind.as_str()])?;
        Ok(records.into_iter().filter(|r| predicate(r)).collect())
    }

    // ── Operation log ────────────────────────────────────────────

    /// Returns up to `limit` log entries, oldest first. Does not remove them.
    pub fn drain_log(&self, limit: usize) -> StorageResult<Vec<OperationLogEntry>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM operation_log ORDER BY id ASC LIMIT ?1");
        collect_entries(&conn, &sql, params![i64::try_from(limit).unwrap_or(i64::MAX)])
    }

    /// Returns the queued entries of one record, oldest first.
    pub fn entries_for(
        &self,
        kind: EntityKind,
        local_id: LocalId,
    ) -> StorageResult<Vec<OperationLogEntry>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM operation_log
             WHERE entity_kind = ?1 AND entity_local_id = ?2 ORDER BY id ASC"
        );
        collect_entries(&conn, &sql, params![kind.as_str(), local_id.get()])
    }

    /// Number of queued entries.
    pub fn pending_count(&self) -> StorageResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM operation_log", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Removes an entry after its push was confirmed.
    ///
    /// For a DELETE the tombstoned record is purged in the same transaction.
    pub fn acknowledge(&self, entry_id: OperationId) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let entry = require_entry(&tx, entry_id)?;
        remove_entry(&tx, entry_id)?;

        if entry.action == Action::Delete {
            tx.execute(
                "DELETE FROM operation_log WHERE entity_kind = ?1 AND entity_local_id = ?2",
                params![entry.entity_kind.as_str(), entry.entity_local_id.get()],
            )?;
            purge_record(&tx, entry.entity_local_id)?;
        } else {
            settle_status(&tx, entry.entity_kind, entry.entity_local_id)?;
        }
        tx.commit()?;

        debug!("Acknowledged {} {} for {} {}", entry.action, entry_id, entry.entity_kind, entry.entity_local_id);
        Ok(())
    }

    /// Acknowledges a CREATE and records the server-assigned id.
    pub fn complete_create(&self, entry_id: OperationId, server_id: &ServerId) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let entry = require_entry(&tx, entry_id)?;
        if entry.action != Action::Create {
            return Err(StorageError::InvalidData(format!(
                "entry {entry_id} is {}, not CREATE",
                entry.action
            )));
        }
        tx.execute(
            "UPDATE records SET server_id = ?1 WHERE local_id = ?2",
            params![server_id.as_str(), entry.entity_local_id.get()],
        )?;
        remove_entry(&tx, entry_id)?;
        settle_status(&tx, entry.entity_kind, entry.entity_local_id)?;
        tx.commit()?;

        debug!("{} {} now has server id {}", entry.entity_kind, entry.entity_local_id, server_id);
        Ok(())
    }

    /// Counts a failed push attempt.
    ///
    /// Once the entry has failed `max_retries` times it is dropped and its
    /// record is marked [`SyncStatus::Error`].
    pub fn record_failure(
        &self,
        entry_id: OperationId,
        message: &str,
        max_retries: u32,
    ) -> StorageResult<FailureOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let entry = require_entry(&tx, entry_id)?;
        let retry_count = entry.retry_count.saturating_add(1);

        if retry_count >= max_retries {
            abandon_entry(&tx, &entry)?;
            tx.commit()?;
            warn!(
                "Abandoned {} {} for {} {} after {} attempts: {}",
                entry.action, entry_id, entry.entity_kind, entry.entity_local_id, retry_count, message
            );
            return Ok(FailureOutcome::Abandoned { retry_count });
        }

        tx.execute(
            "UPDATE operation_log SET retry_count = ?1, last_error = ?2 WHERE id = ?3",
            params![retry_count, message, entry_id.get()],
        )?;
        tx.commit()?;
        debug!("Entry {} failed (attempt {}): {}", entry_id, retry_count, message);
        Ok(FailureOutcome::Retrying { retry_count })
    }

    /// Drops an entry without further retries and marks its record as errored.
    pub fn abandon(&self, entry_id: OperationId, message: &str) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let entry = require_entry(&tx, entry_id)?;
        abandon_entry(&tx, &entry)?;
        tx.commit()?;
        warn!(
            "Abandoned {} {} for {} {}: {}",
            entry.action, entry_id, entry.entity_kind, entry.entity_local_id, message
        );
        Ok(())
    }

    // ── Reconciliation ───────────────────────────────────────────

    /// Reconciles one authoritative server record with local state.
    ///
    /// The local copy is found by server id, falling back to the offline id
    /// for records whose CREATE ack never arrived. A synced local copy simply
    /// takes the server values; pending or errored copies go through
    /// `strategy`.
    pub fn merge_remote(
        &self,
        kind: EntityKind,
        remote: &RemoteRecord,
        strategy: ConflictStrategy,
    ) -> StorageResult<MergeOutcome> {
        ensure_object(&remote.payload)?;
        let remote_json = serde_json::to_string(&remote.payload)?;
        let remote_time = remote.updated_at.unwrap_or_else(Timestamp::now);

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(mut local) = find_remote_match(&tx, kind, remote)? else {
            let discarded = match remote.offline_id {
                Some(offline_id) => take_discarded(&tx, kind, offline_id)?,
                None => false,
            };
            let status = if discarded {
                SyncStatus::Pending
            } else {
                SyncStatus::Synced
            };
            let offline_id = remote.offline_id.unwrap_or_default();
            tx.execute(
                "INSERT INTO records (entity_kind, server_id, offline_id, payload, sync_status, updated_at, deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    kind.as_str(),
                    remote.server_id.as_str(),
                    offline_id.to_string(),
                    remote_json,
                    status.as_str(),
                    remote_time.as_millis(),
                    discarded,
                ],
            )?;
            let local_id = LocalId::new(tx.last_insert_rowid());
            if discarded {
                // Deleted locally while its CREATE was in flight.
                append_entry(&tx, Action::Delete, kind, local_id, &remote_json, Timestamp::now())?;
                tx.commit()?;
                info!(
                    "{} {} was deleted locally before its create landed, queued DELETE",
                    kind, remote.server_id
                );
                return Ok(MergeOutcome::SkippedTombstone(local_id));
            }
            tx.commit()?;
            return Ok(MergeOutcome::Inserted(local_id));
        };

        let local_id = local.local_id;
        if local.deleted {
            return Ok(MergeOutcome::SkippedTombstone(local_id));
        }

        let linking = local.server_id.as_ref() != Some(&remote.server_id);
        if linking {
            local.server_id = Some(remote.server_id.clone());
            // The server already holds this record, so a queued CREATE
            // must be replayed as an UPDATE against the linked id.
            tx.execute(
                "UPDATE operation_log SET action = ?1
                 WHERE entity_kind = ?2 AND entity_local_id = ?3 AND action = ?4",
                params![
                    Action::Update.as_str(),
                    kind.as_str(),
                    local_id.get(),
                    Action::Create.as_str(),
                ],
            )?;
            info!("Linked {} {} to server id {}", kind, local_id, remote.server_id);
        }

        let outcome = if local.sync_status == SyncStatus::Synced {
            if !linking && local.payload == remote.payload {
                MergeOutcome::Unchanged(local_id)
            } else {
                local.payload = remote.payload.clone();
                local.updated_at = remote_time;
                write_record(&tx, &local)?;
                MergeOutcome::Updated(local_id)
            }
        } else {
            match strategy {
                ConflictStrategy::Server => {
                    tx.execute(
                        "DELETE FROM operation_log WHERE entity_kind = ?1 AND entity_local_id = ?2",
                        params![kind.as_str(), local_id.get()],
                    )?;
                    local.payload = remote.payload.clone();
                    local.sync_status = SyncStatus::Synced;
                    local.updated_at = remote_time;
                    write_record(&tx, &local)?;
                    MergeOutcome::Updated(local_id)
                }
                ConflictStrategy::Local => {
                    if linking {
                        write_record(&tx, &local)?;
                    }
                    MergeOutcome::Kept(local_id)
                }
                ConflictStrategy::Merge => {
                    let overlap = conflicting_fields(&local.payload, &remote.payload);
                    if !overlap.is_empty() {
                        debug!(
                            "{} {} changed on both sides, server wins on {:?}",
                            kind, local_id, overlap
                        );
                    }
                    let merged = resolve_conflict(&local.payload, &remote.payload, strategy);
                    if merged == local.payload {
                        if linking {
                            write_record(&tx, &local)?;
                        }
                        MergeOutcome::Kept(local_id)
                    } else {
                        local.payload = merged;
                        local.updated_at = Timestamp::now();
                        write_record(&tx, &local)?;
                        // Queued UPDATEs replay the merged state so the push
                        // does not erase server fields.
                        tx.execute(
                            "UPDATE operation_log SET payload = ?1
                             WHERE entity_kind = ?2 AND entity_local_id = ?3 AND action = ?4",
                            params![
                                serde_json::to_string(&local.payload)?,
                                kind.as_str(),
                                local_id.get(),
                                Action::Update.as_str(),
                            ],
                        )?;
                        MergeOutcome::Updated(local_id)
                    }
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    // ── Sync metadata ────────────────────────────────────────────

    /// Reads a metadata value.
    pub fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM sync_meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    /// Writes a metadata value.
    pub fn set_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// When the last successful sync cycle finished.
    pub fn last_sync_time(&self) -> StorageResult<Option<Timestamp>> {
        match self.get_meta(LAST_SYNC_KEY)? {
            Some(raw) => raw
                .parse::<i64>()
                .map(|millis| Some(Timestamp::from_millis(millis)))
                .map_err(|e| StorageError::InvalidData(format!("invalid {LAST_SYNC_KEY}: {e}"))),
            None => Ok(None),
        }
    }

    pub fn set_last_sync_time(&self, at: Timestamp) -> StorageResult<()> {
        self.set_meta(LAST_SYNC_KEY, &at.as_millis().to_string())
    }
}

// ── Row mapping ──────────────────────────────────────────────────

struct RecordRow {
    local_id: i64,
    entity_kind: String,
    server_id: Option<String>,
    offline_id: String,
    payload: String,
    sync_status: String,
    updated_at: i64,
    deleted: bool,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            entity_kind: row.get(1)?,
            server_id: row.get(2)?,
            offline_id: row.get(3)?,
            payload: row.get(4)?,
            sync_status: row.get(5)?,
            updated_at: row.get(6)?,
            deleted: row.get(7)?,
        })
    }

    fn into_record(self) -> StorageResult<Record> {
        let offline_id = OfflineId::parse(&self.offline_id)
            .map_err(|e| StorageError::InvalidData(format!("invalid offline_id: {e}")))?;
        Ok(Record {
            local_id: LocalId::new(self.local_id),
            entity_kind: self.entity_kind.parse()?,
            server_id: self.server_id.map(ServerId::from),
            offline_id,
            payload: serde_json::from_str(&self.payload)?,
            sync_status: self.sync_status.parse()?,
            updated_at: Timestamp::from_millis(self.updated_at),
            deleted: self.deleted,
        })
    }
}

struct EntryRow {
    id: i64,
    action: String,
    entity_kind: String,
    entity_local_id: i64,
    payload: String,
    created_at: i64,
    retry_count: u32,
    last_error: Option<String>,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            action: row.get(1)?,
            entity_kind: row.get(2)?,
            entity_local_id: row.get(3)?,
            payload: row.get(4)?,
            created_at: row.get(5)?,
            retry_count: row.get(6)?,
            last_error: row.get(7)?,
        })
    }

    fn into_entry(self) -> StorageResult<OperationLogEntry> {
        Ok(OperationLogEntry {
            id: OperationId::new(self.id),
            action: self.action.parse()?,
            entity_kind: self.entity_kind.parse()?,
            entity_local_id: LocalId::new(self.entity_local_id),
            payload: serde_json::from_str(&self.payload)?,
            created_at: Timestamp::from_millis(self.created_at),
            retry_count: self.retry_count,
            last_error: self.last_error,
        })
    }
}

fn collect_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> StorageResult<Vec<Record>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, RecordRow::from_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

fn collect_entries<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> StorageResult<Vec<OperationLogEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, EntryRow::from_row)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?.into_entry()?);
    }
    Ok(entries)
}

// ── Transaction helpers ──────────────────────────────────────────

fn ensure_object(payload: &Value) -> StorageResult<()> {
    if payload.is_object() {
        Ok(())
    } else {
        Err(StorageError::InvalidData("payload must be a JSON object".into()))
    }
}

fn apply_patch(payload: &mut Value, patch: Map<String, Value>) {
    if !payload.is_object() {
        *payload = Value::Object(Map::new());
    }
    if let Value::Object(fields) = payload {
        for (key, value) in patch {
            if value.is_null() {
                fields.remove(&key);
            } else {
                fields.insert(key, value);
            }
        }
    }
}

fn load_record(conn: &Connection, local_id: LocalId) -> StorageResult<Option<Record>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE local_id = ?1");
    let row = conn
        .query_row(&sql, params![local_id.get()], RecordRow::from_row)
        .optional()?;
    row.map(RecordRow::into_record).transpose()
}

fn load_live_record(conn: &Connection, kind: EntityKind, local_id: LocalId) -> StorageResult<Record> {
    load_record(conn, local_id)?
        .filter(|r| r.entity_kind == kind && !r.deleted)
        .ok_or_else(|| StorageError::NotFound(format!("{kind} {local_id}")))
}

fn find_remote_match(
    conn: &Connection,
    kind: EntityKind,
    remote: &RemoteRecord,
) -> StorageResult<Option<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE entity_kind = ?1 AND server_id = ?2"
    );
    if let Some(record) = collect_records(conn, &sql, params![kind.as_str(), remote.server_id.as_str()])?.pop() {
        return Ok(Some(record));
    }
    let Some(offline_id) = remote.offline_id else {
        return Ok(None);
    };
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM records
         WHERE entity_kind = ?1 AND offline_id = ?2 AND server_id IS NULL"
    );
    Ok(collect_records(conn, &sql, params![kind.as_str(), offline_id.to_string()])?.pop())
}

/// Forgets a discarded offline id, returning whether it was known.
fn take_discarded(conn: &Connection, kind: EntityKind, offline_id: OfflineId) -> StorageResult<bool> {
    let removed = conn.execute(
        "DELETE FROM discarded_records WHERE entity_kind = ?1 AND offline_id = ?2",
        params![kind.as_str(), offline_id.to_string()],
    )?;
    Ok(removed > 0)
}

fn write_record(conn: &Connection, record: &Record) -> StorageResult<()> {
    conn.execute(
        "UPDATE records SET server_id = ?1, payload = ?2, sync_status = ?3, updated_at = ?4, deleted = ?5
         WHERE local_id = ?6",
        params![
            record.server_id.as_ref().map(ServerId::as_str),
            serde_json::to_string(&record.payload)?,
            record.sync_status.as_str(),
            record.updated_at.as_millis(),
            record.deleted,
            record.local_id.get(),
        ],
    )?;
    Ok(())
}

fn purge_record(conn: &Connection, local_id: LocalId) -> StorageResult<()> {
    conn.execute("DELETE FROM records WHERE local_id = ?1", params![local_id.get()])?;
    conn.execute(
        "DELETE FROM upload_queue WHERE entity_local_id = ?1",
        params![local_id.get()],
    )?;
    Ok(())
}

fn append_entry(
    conn: &Connection,
    action: Action,
    kind: EntityKind,
    local_id: LocalId,
    payload_json: &str,
    now: Timestamp,
) -> StorageResult<OperationId> {
    conn.execute(
        "INSERT INTO operation_log (action, entity_kind, entity_local_id, payload, created_at, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![action.as_str(), kind.as_str(), local_id.get(), payload_json, now.as_millis()],
    )?;
    Ok(OperationId::new(conn.last_insert_rowid()))
}

fn require_entry(conn: &Connection, entry_id: OperationId) -> StorageResult<OperationLogEntry> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM operation_log WHERE id = ?1");
    conn.query_row(&sql, params![entry_id.get()], EntryRow::from_row)
        .optional()?
        .ok_or_else(|| StorageError::NotFound(format!("log entry {entry_id}")))?
        .into_entry()
}

fn remove_entry(conn: &Connection, entry_id: OperationId) -> StorageResult<()> {
    conn.execute("DELETE FROM operation_log WHERE id = ?1", params![entry_id.get()])?;
    Ok(())
}

/// Moves a pending record to synced once nothing is queued for it.
/// Errored records stay errored until explicitly retried.
fn settle_status(conn: &Connection, kind: EntityKind, local_id: LocalId) -> StorageResult<()> {
    let remaining: i64 = conn.query_row(
        "SELECT COUNT(*) FROM operation_log WHERE entity_kind = ?1 AND entity_local_id = ?2",
        params![kind.as_str(), local_id.get()],
        |row| row.get(0),
    )?;
    let status = if remaining > 0 {
        SyncStatus::Pending
    } else {
        SyncStatus::Synced
    };
    conn.execute(
        "UPDATE records SET sync_status = ?1 WHERE local_id = ?2 AND sync_status != ?3",
        params![status.as_str(), local_id.get(), SyncStatus::Error.as_str()],
    )?;
    Ok(())
}

/// Drops an entry for good. An abandoned CREATE takes the record's later
/// entries with it, since none of them can reach a server id. A tombstone
/// whose DELETE is abandoned becomes visible again so the UI can offer a
/// retry.
fn abandon_entry(conn: &Connection, entry: &OperationLogEntry) -> StorageResult<()> {
    if entry.action == Action::Create {
        conn.execute(
            "DELETE FROM operation_log WHERE entity_kind = ?1 AND entity_local_id = ?2",
            params![entry.entity_kind.as_str(), entry.entity_local_id.get()],
        )?;
    } else {
        remove_entry(conn, entry.id)?;
    }
    conn.execute(
        "UPDATE records SET sync_status = ?1, deleted = 0 WHERE local_id = ?2",
        params![SyncStatus::Error.as_str(), entry.entity_local_id.get()],
    )?;
    Ok(())
}
