//! Sync cycle state and reporting types.

use fieldsync_types::Timestamp;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Stage of the running cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Pushing,
    Pulling,
    Reconciling,
}

impl SyncPhase {
    const fn to_u8(self) -> u8 {
        match self {
            SyncPhase::Idle => 0,
            SyncPhase::Pushing => 1,
            SyncPhase::Pulling => 2,
            SyncPhase::Reconciling => 3,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SyncPhase::Pushing,
            2 => SyncPhase::Pulling,
            3 => SyncPhase::Reconciling,
            _ => SyncPhase::Idle,
        }
    }
}

/// Lock-free cell holding the current [`SyncPhase`].
#[derive(Debug)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(SyncPhase::Idle.to_u8()))
    }

    pub(crate) fn get(&self) -> SyncPhase {
        SyncPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, phase: SyncPhase) {
        self.0.store(phase.to_u8(), Ordering::Release);
    }
}

/// Counters for one sync cycle. Lives only for the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    pub started_at: Timestamp,
    pub is_forced: bool,
    pub uploaded_count: usize,
    pub downloaded_count: usize,
    pub failed_count: usize,
    pub error: Option<String>,
}

impl SyncSession {
    pub fn new(is_forced: bool) -> Self {
        Self {
            started_at: Timestamp::now(),
            is_forced,
            uploaded_count: 0,
            downloaded_count: 0,
            failed_count: 0,
            error: None,
        }
    }
}

/// Why a requested cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
    /// The previous cycle finished less than the minimum interval ago.
    Throttled,
}

impl SkipReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadySyncing => "already syncing",
            SkipReason::Offline => "offline",
            SkipReason::Throttled => "throttled",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`crate::SyncEngine::sync_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed {
        uploaded: usize,
        downloaded: usize,
        /// Entries that failed this cycle and were retried later or abandoned.
        failed: usize,
        timestamp: Timestamp,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        error: String,
        auth_required: bool,
        timestamp: Timestamp,
    },
}

impl SyncOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Completed { .. })
    }

    #[must_use]
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            SyncOutcome::Skipped { reason } => Some(*reason),
            _ => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            SyncOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Point-in-time view for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusSnapshot {
    pub is_syncing: bool,
    pub is_online: bool,
    pub phase: SyncPhase,
    pub last_sync_time: Option<Timestamp>,
    pub pending_operations: usize,
}
