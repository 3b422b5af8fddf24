//! Operation log entries.
//!
//! Every mutating store write appends one entry in the same transaction.
//! An entry lives until the sync engine confirms the matching remote call,
//! or until it has failed [`MAX_RETRIES`] times.

use crate::{EntityKind, Error, LocalId, OperationId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Number of failed attempts after which an entry is abandoned.
pub const MAX_RETRIES: u32 = 3;

/// The mutation an entry replays against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }

    /// Position of this action within one entity's history.
    ///
    /// A record is created once, updated any number of times, and deleted
    /// at most once, so sorting by rank restores causal order even when
    /// log ids are out of order.
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Action::Create => 0,
            Action::Update => 1,
            Action::Delete => 2,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Action::Create),
            "UPDATE" => Ok(Action::Update),
            "DELETE" => Ok(Action::Delete),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    /// Monotonic log id.
    pub id: OperationId,
    pub action: Action,
    pub entity_kind: EntityKind,
    pub entity_local_id: LocalId,
    /// Payload snapshot taken when the mutation was written.
    pub payload: Value,
    pub created_at: Timestamp,
    /// Failed push attempts so far.
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl OperationLogEntry {
    /// Key used to group entries that must be pushed in order.
    #[must_use]
    pub fn entity_key(&self) -> (EntityKind, LocalId) {
        (self.entity_kind, self.entity_local_id)
    }

    /// Returns true once the entry has used up its attempts.
    #[must_use]
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}
