//! Deferred upload queue for photos and signatures.
//!
//! Only the durable queue lives here. Transferring the bytes is left to the
//! host, which drains the queue once the owning record has a server id.

use crate::error::{StorageError, StorageResult};
use crate::local_store::LocalStore;
use fieldsync_types::{LocalId, Timestamp};
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// A binary waiting to be uploaded for a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTicket {
    pub id: i64,
    pub entity_local_id: LocalId,
    pub file_path: String,
    pub queued_at: Timestamp,
    pub attempts: u32,
}

impl LocalStore {
    /// Queues a file for upload on behalf of an existing record.
    pub fn enqueue_upload(&self, local_id: LocalId, file_path: &str) -> StorageResult<UploadTicket> {
        let queued_at = Timestamp::now();
        let conn = self.conn()?;
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE local_id = ?1 AND deleted = 0",
            params![local_id.get()],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(StorageError::NotFound(format!("record {local_id}")));
        }
        conn.execute(
            "INSERT INTO upload_queue (entity_local_id, file_path, queued_at, attempts) VALUES (?1, ?2, ?3, 0)",
            params![local_id.get(), file_path, queued_at.as_millis()],
        )?;
        Ok(UploadTicket {
            id: conn.last_insert_rowid(),
            entity_local_id: local_id,
            file_path: file_path.to_string(),
            queued_at,
            attempts: 0,
        })
    }

    /// Queued uploads, oldest first.
    pub fn pending_uploads(&self) -> StorageResult<Vec<UploadTicket>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_local_id, file_path, queued_at, attempts FROM upload_queue ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UploadTicket {
                id: row.get(0)?,
                entity_local_id: LocalId::new(row.get(1)?),
                file_path: row.get(2)?,
                queued_at: Timestamp::from_millis(row.get(3)?),
                attempts: row.get(4)?,
            })
        })?;
        let mut tickets = Vec::new();
        for row in rows {
            tickets.push(row?);
        }
        Ok(tickets)
    }

    /// Counts a failed upload attempt and returns the new attempt count.
    pub fn record_upload_attempt(&self, ticket_id: i64) -> StorageResult<u32> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE upload_queue SET attempts = attempts + 1 WHERE id = ?1",
            params![ticket_id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("upload {ticket_id}")));
        }
        let attempts = conn.query_row(
            "SELECT attempts FROM upload_queue WHERE id = ?1",
            params![ticket_id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// Removes a finished upload. Returns false if it was not queued.
    pub fn complete_upload(&self, ticket_id: i64) -> StorageResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM upload_queue WHERE id = ?1", params![ticket_id])?;
        Ok(removed > 0)
    }
}
