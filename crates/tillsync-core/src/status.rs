//! # Sync Status Types
//!
//! Run audit records and the simplified status objects published to the UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::new_local_id;

/// Result of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SyncOutcome {
    /// Every phase ran and nothing failed.
    Success,
    /// Some work committed, but a phase failed or the time budget ran out.
    Partial,
    /// Nothing was done (e.g. the authority was unreachable).
    Failure,
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SyncTrigger {
    Periodic,
    ConnectivityRestored,
    QueuePending,
    Forced,
}

/// Append-only audit record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct SyncRun {
    pub id: String,
    #[cfg_attr(feature = "sqlx", sqlx(rename = "trigger_source"))]
    pub trigger: SyncTrigger,
    #[ts(as = "String")]
    pub started_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub completed_at: DateTime<Utc>,
    pub pulled_count: i64,
    pub pushed_count: i64,
    pub conflict_count: i64,
    pub outcome: SyncOutcome,
    /// True when the pull phase finished for every table. The next pull
    /// resumes from this run's `started_at`.
    pub pull_succeeded: bool,
    pub error: Option<String>,
}

impl SyncRun {
    /// Starts a run record; counts are filled in as phases complete.
    pub fn begin(trigger: SyncTrigger) -> Self {
        let now = Utc::now();
        SyncRun {
            id: new_local_id(),
            trigger,
            started_at: now,
            completed_at: now,
            pulled_count: 0,
            pushed_count: 0,
            conflict_count: 0,
            outcome: SyncOutcome::Success,
            pull_succeeded: false,
            error: None,
        }
    }
}

/// Payload of the `syncStatusChanged` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncStatusUpdate {
    pub is_online: bool,
    pub sync_in_progress: bool,
    pub pending_item_count: i64,
    #[ts(as = "Option<String>")]
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Payload of the `syncQueueUpdated` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub failed: i64,
    pub completed: i64,
}

/// Where a facade read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum DataSource {
    Local,
    Remote,
    RemoteFallbackToLocal,
}
