//! Device-side sync state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Connection/sync status of a device client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Offline,
    Error,
}

impl SyncStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// ```text
    /// IDLE -> SYNCING -> IDLE
    /// IDLE | SYNCING | ERROR -> OFFLINE -> SYNCING
    /// SYNCING -> ERROR -> SYNCING
    /// ```
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Idle, Syncing)
                | (Syncing, Idle)
                | (Idle, Offline)
                | (Syncing, Offline)
                | (Error, Offline)
                | (Offline, Syncing)
                | (Syncing, Error)
                | (Error, Syncing)
        ) || self == next
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Offline => write!(f, "offline"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of a device client's sync state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    /// Cursor per collection: latest `lastModified` fully applied.
    pub last_sync: BTreeMap<String, DateTime<Utc>>,
    pub error: Option<String>,
    /// Collections with at least one active subscription.
    pub collections: Vec<String>,
}

impl SyncState {
    /// Moves to `next` if the transition is allowed. Returns whether it moved.
    pub fn transition(&mut self, next: SyncStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next != SyncStatus::Error {
            self.error = None;
        }
        true
    }

    /// Returns to IDLE after a successful sync. A failure recorded by a
    /// concurrent sync is cleared by passing back through SYNCING.
    pub fn settle(&mut self) -> bool {
        if self.status != SyncStatus::Syncing {
            self.transition(SyncStatus::Syncing);
        }
        self.transition(SyncStatus::Idle)
    }

    /// Records a failure and moves to `status` (`Error` or `Offline`).
    pub fn fail(&mut self, status: SyncStatus, error: impl Into<String>) -> bool {
        let moved = self.transition(status);
        if moved {
            self.error = Some(error.into());
        }
        moved
    }
}
