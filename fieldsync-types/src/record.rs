//! Domain records as held by the local store.

use crate::{Error, LocalId, OfflineId, ServerId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The kinds of entity a field technician captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    WorkOrder,
    Appointment,
    Customer,
    Attachment,
    Signature,
}

impl EntityKind {
    /// Every kind, in the order they are pulled.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Customer,
        EntityKind::WorkOrder,
        EntityKind::Appointment,
        EntityKind::Attachment,
        EntityKind::Signature,
    ];

    /// Storage key for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityKind::WorkOrder => "work_order",
            EntityKind::Appointment => "appointment",
            EntityKind::Customer => "customer",
            EntityKind::Attachment => "attachment",
            EntityKind::Signature => "signature",
        }
    }

    /// Remote collection path segment for this kind.
    #[must_use]
    pub const fn collection(&self) -> &'static str {
        match self {
            EntityKind::WorkOrder => "work-orders",
            EntityKind::Appointment => "appointments",
            EntityKind::Customer => "customers",
            EntityKind::Attachment => "attachments",
            EntityKind::Signature => "signatures",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "work_order" => Ok(EntityKind::WorkOrder),
            "appointment" => Ok(EntityKind::Appointment),
            "customer" => Ok(EntityKind::Customer),
            "attachment" => Ok(EntityKind::Attachment),
            "signature" => Ok(EntityKind::Signature),
            other => Err(Error::UnknownEntityKind(other.to_string())),
        }
    }
}

/// Whether a record's local state has reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local changes are queued in the operation log.
    Pending,
    /// Local state matches the last server ack or pull.
    Synced,
    /// A queued change was abandoned; the UI should offer a manual retry.
    Error,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            other => Err(Error::UnknownSyncStatus(other.to_string())),
        }
    }
}

/// A domain entity with its local and remote identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Local rowid, stable for the lifetime of the record.
    pub local_id: LocalId,
    /// What kind of entity this is.
    pub entity_kind: EntityKind,
    /// Server-assigned id, `None` until a create round-trips.
    pub server_id: Option<ServerId>,
    /// Idempotency key for the create push. Never regenerated.
    pub offline_id: OfflineId,
    /// Domain fields, always a JSON object.
    pub payload: Value,
    pub sync_status: SyncStatus,
    pub updated_at: Timestamp,
    /// Set while a DELETE is queued; tombstones are hidden from queries.
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Returns true once the server knows this record.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.server_id.is_some()
    }

    /// Returns true while local changes wait in the operation log.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    /// Reads a top-level payload field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

/// An authoritative copy of a record as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub server_id: ServerId,
    /// Echoed back by the server when the record was created by a client.
    #[serde(default)]
    pub offline_id: Option<OfflineId>,
    /// Domain fields without the identity columns.
    pub payload: Value,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

impl RemoteRecord {
    #[must_use]
    pub fn new(server_id: impl Into<ServerId>, payload: Value) -> Self {
        Self {
            server_id: server_id.into(),
            offline_id: None,
            payload,
            updated_at: None,
        }
    }

    #[must_use]
    pub fn with_offline_id(mut self, offline_id: OfflineId) -> Self {
        self.offline_id = Some(offline_id);
        self
    }
}
