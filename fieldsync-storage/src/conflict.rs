//! Conflict policy between a locally pending record and a pulled server copy.
//!
//! This is a field-level heuristic, not a CRDT. "Locally modified" means
//! "present in the local payload": a field the client never set is
//! indistinguishable from one it edited.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// How to reconcile local pending state with an authoritative record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Server fully replaces local.
    Server,
    /// Local is kept, the server copy is discarded.
    Local,
    /// Local fields survive, server fields are applied over them.
    #[default]
    Merge,
}

impl ConflictStrategy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Server => "server",
            ConflictStrategy::Local => "local",
            ConflictStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(ConflictStrategy::Server),
            "local" => Ok(ConflictStrategy::Local),
            "merge" => Ok(ConflictStrategy::Merge),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

/// Resolves a conflict between two payloads.
///
/// With [`ConflictStrategy::Merge`] both sides must be JSON objects; the
/// server copy wins on any field both sides carry. Non-object payloads fall
/// back to the server value.
#[must_use]
pub fn resolve_conflict(local: &Value, server: &Value, strategy: ConflictStrategy) -> Value {
    match strategy {
        ConflictStrategy::Server => server.clone(),
        ConflictStrategy::Local => local.clone(),
        ConflictStrategy::Merge => match (local.as_object(), server.as_object()) {
            (Some(local_fields), Some(server_fields)) => {
                let mut merged = local_fields.clone();
                for (key, value) in server_fields {
                    merged.insert(key.clone(), value.clone());
                }
                Value::Object(merged)
            }
            _ => server.clone(),
        },
    }
}

/// Fields both payloads carry with different values.
#[must_use]
pub fn conflicting_fields(local: &Value, server: &Value) -> Vec<String> {
    let (Some(local_fields), Some(server_fields)) = (local.as_object(), server.as_object()) else {
        return Vec::new();
    };
    local_fields
        .iter()
        .filter(|(key, value)| server_fields.get(*key).is_some_and(|s| s != *value))
        .map(|(key, _)| key.clone())
        .collect()
}
