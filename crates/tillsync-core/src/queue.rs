//! # Change Queue Types
//!
//! The durable outbox item and its ordering / retry rules.
//!
//! ## Item Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         QueueItem lifecycle                             │
//! │                                                                         │
//! │   enqueue ──► pending ──dequeue──► processing ──ok──► completed         │
//! │                  ▲                     │                                │
//! │                  │   retryable error   │                                │
//! │                  └──── retry_count+1 ◄─┤                                │
//! │                     next_attempt_at =  │                                │
//! │                     now + BACKOFF[n]   │ retry_count reaches 5          │
//! │                                        │ or authority rejected          │
//! │                                        ▼                                │
//! │                                      failed  (dead letter, manual)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dequeue Ordering
//! `(priority, retry_count, created_at)` ascending, with priority ranked
//! high → normal → low. Items whose backoff has not elapsed are skipped.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use ts_rs::TS;

use crate::types::{new_local_id, EntitySnapshot, EntityTable};

/// Retry attempts before an item becomes terminal.
pub const MAX_RETRIES: i64 = 5;

/// Delay before the next attempt, indexed by retry count.
pub const BACKOFF_SCHEDULE_SECS: [i64; 5] = [1, 5, 15, 30, 60];

/// Returns the backoff for an item that has failed `retry_count` times.
///
/// The table is indexed by the retry count *before* the failure was counted,
/// so the first failure waits 1s and the fifth would wait 60s. Counts past the
/// end of the table clamp to the last entry.
///
/// ## Example
/// ```rust
/// use tillsync_core::queue::backoff_for;
///
/// assert_eq!(backoff_for(0).num_seconds(), 1);
/// assert_eq!(backoff_for(4).num_seconds(), 60);
/// assert_eq!(backoff_for(9).num_seconds(), 60);
/// ```
pub fn backoff_for(retry_count: i64) -> Duration {
    let last = BACKOFF_SCHEDULE_SECS.len() - 1;
    let idx = usize::try_from(retry_count).unwrap_or(0).min(last);
    Duration::seconds(BACKOFF_SCHEDULE_SECS[idx])
}

// =============================================================================
// Operation / Priority / Status
// =============================================================================

/// The mutation an item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// Dequeue priority. `High` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort rank, lower goes first.
    pub const fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    /// Default priority of mutations on `table`. Money-bearing records go
    /// first so revenue reaches the authority before catalog edits.
    pub const fn for_table(table: EntityTable) -> Priority {
        match table {
            EntityTable::Sales | EntityTable::SaleItems => Priority::High,
            _ => Priority::Normal,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Processing state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum QueueStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

// =============================================================================
// Typed Payload
// =============================================================================

/// What a queue item asks the authority to do.
///
/// Creates and updates carry the full entity snapshot taken when the write
/// committed. Deletes carry only identity, since the row is already gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "operation", rename_all = "snake_case")]
#[ts(export)]
pub enum QueueMutation {
    Create {
        snapshot: EntitySnapshot,
    },
    Update {
        snapshot: EntitySnapshot,
    },
    Delete {
        entity_table: EntityTable,
        local_id: String,
        remote_id: String,
    },
}

impl QueueMutation {
    pub fn operation(&self) -> Operation {
        match self {
            QueueMutation::Create { .. } => Operation::Create,
            QueueMutation::Update { .. } => Operation::Update,
            QueueMutation::Delete { .. } => Operation::Delete,
        }
    }

    pub fn table(&self) -> EntityTable {
        match self {
            QueueMutation::Create { snapshot } | QueueMutation::Update { snapshot } => {
                snapshot.table()
            }
            QueueMutation::Delete { entity_table, .. } => *entity_table,
        }
    }

    pub fn local_id(&self) -> &str {
        match self {
            QueueMutation::Create { snapshot } | QueueMutation::Update { snapshot } => {
                snapshot.local_id()
            }
            QueueMutation::Delete { local_id, .. } => local_id,
        }
    }

    pub fn snapshot(&self) -> Option<&EntitySnapshot> {
        match self {
            QueueMutation::Create { snapshot } | QueueMutation::Update { snapshot } => {
                Some(snapshot)
            }
            QueueMutation::Delete { .. } => None,
        }
    }
}

// =============================================================================
// Queue Item
// =============================================================================

/// A durable, pending mutation waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub entity_table: EntityTable,
    pub entity_local_id: String,
    pub operation: Operation,
    pub payload: QueueMutation,
    pub priority: Priority,
    pub retry_count: i64,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the item may be dequeued again
    /// (`last_attempt_at + backoff`).
    pub next_attempt_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl QueueItem {
    /// Builds a fresh pending item for `mutation`, due immediately.
    pub fn new(mutation: QueueMutation) -> Self {
        let now = Utc::now();
        let entity_table = mutation.table();
        QueueItem {
            id: new_local_id(),
            entity_table,
            entity_local_id: mutation.local_id().to_string(),
            operation: mutation.operation(),
            payload: mutation,
            priority: Priority::for_table(entity_table),
            retry_count: 0,
            status: QueueStatus::Pending,
            created_at: now,
            last_attempt_at: None,
            next_attempt_at: now,
            error: None,
        }
    }

    /// Overrides the default table priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Ordering key used by dequeue.
    pub fn dequeue_key(&self) -> (u8, i64, DateTime<Utc>) {
        (self.priority.rank(), self.retry_count, self.created_at)
    }

    /// True if the item may be dequeued at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending && self.next_attempt_at <= now
    }

    /// True once the item needs manual intervention.
    pub fn is_terminal(&self) -> bool {
        self.status == QueueStatus::Failed
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
