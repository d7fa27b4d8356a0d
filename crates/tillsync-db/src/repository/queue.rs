//! # Change Queue Repository
//!
//! Durable storage for outbound mutations (`queue_items`).
//!
//! ## Queue Table Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    queue_items state transitions                        │
//! │                                                                         │
//! │  LOCAL WRITE (insert / update / delete / create_sale)                  │
//! │       │  same transaction                                               │
//! │       ▼                                                                 │
//! │  pending ──dequeue_batch()──► mark_processing() ──► processing          │
//! │     ▲                                                  │               │
//! │     │                       mark_completed() ◄─────────┤               │
//! │     │                             │                    │               │
//! │     │                             ▼                    │               │
//! │     │                         completed                │               │
//! │     │                                                  │               │
//! │     └── mark_failed() (retry_count < 5, backoff) ◄─────┤               │
//! │                                                        │               │
//! │         failed ◄── mark_failed() at 5 / mark_rejected()┘               │
//! │           │                                                             │
//! │           └── requeue_failed() (manual) ──► pending, retry_count = 0    │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • retry_count never exceeds 5 (CHECK constraint + transition rule)    │
//! │  • completed / failed items are never picked up again automatically    │
//! │  • an item is not dequeued before next_attempt_at                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use tillsync_core::{
    backoff_for, EntityTable, Operation, Priority, QueueItem, QueueMutation, QueueStats,
    QueueStatus, MAX_RETRIES,
};

use crate::error::{DbError, DbResult};

const SELECT_ITEM: &str = r#"
    SELECT id, entity_table, entity_local_id, operation, payload, priority,
           retry_count, status, created_at, last_attempt_at, next_attempt_at, error
    FROM queue_items
"#;

// =============================================================================
// Row Mapping
// =============================================================================

/// `queue_items` row as stored. The payload is a JSON column.
#[derive(Debug, FromRow)]
struct QueueRow {
    id: String,
    entity_table: EntityTable,
    entity_local_id: String,
    operation: Operation,
    payload: String,
    priority: Priority,
    retry_count: i64,
    status: QueueStatus,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    next_attempt_at: i64,
    error: Option<String>,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = DbError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let payload: QueueMutation = serde_json::from_str(&row.payload)?;
        let next_attempt_at = Utc
            .timestamp_millis_opt(row.next_attempt_at)
            .single()
            .unwrap_or(row.created_at);

        Ok(QueueItem {
            id: row.id,
            entity_table: row.entity_table,
            entity_local_id: row.entity_local_id,
            operation: row.operation,
            payload,
            priority: row.priority,
            retry_count: row.retry_count,
            status: row.status,
            created_at: row.created_at,
            last_attempt_at: row.last_attempt_at,
            next_attempt_at,
            error: row.error,
        })
    }
}

fn into_items(rows: Vec<QueueRow>) -> DbResult<Vec<QueueItem>> {
    rows.into_iter().map(QueueItem::try_from).collect()
}

// =============================================================================
// Connection-level Functions (usable inside a transaction)
// =============================================================================

/// Inserts an item. Re-submitting an existing item id is a no-op.
///
/// ## Returns
/// `true` if a new row was written.
pub async fn enqueue_on(conn: &mut SqliteConnection, item: &QueueItem) -> DbResult<bool> {
    let payload = serde_json::to_string(&item.payload)?;

    let result = sqlx::query(
        r#"
        INSERT INTO queue_items (
            id, entity_table, entity_local_id, operation, payload, priority,
            retry_count, status, created_at, last_attempt_at, next_attempt_at, error
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&item.id)
    .bind(item.entity_table)
    .bind(&item.entity_local_id)
    .bind(item.operation)
    .bind(payload)
    .bind(item.priority)
    .bind(item.retry_count)
    .bind(item.status)
    .bind(item.created_at)
    .bind(item.last_attempt_at)
    .bind(item.next_attempt_at.timestamp_millis())
    .bind(&item.error)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Records the sync intent of a local write.
///
/// ## Coalescing
/// A create or update for a row that already has a *pending* create/update
/// item refreshes that item's snapshot instead of appending another item. An
/// item that is mid-push (`processing`) is left alone and a new item follows
/// it. A snapshot without a remote identifier always yields a create.
///
/// A delete cancels whatever is still pending for the row first.
pub async fn enqueue_change_on(
    conn: &mut SqliteConnection,
    mutation: QueueMutation,
) -> DbResult<QueueItem> {
    let table = mutation.table();
    let local_id = mutation.local_id().to_string();

    let mutation = match mutation {
        QueueMutation::Delete { .. } => {
            drop_pending_for_entity_on(&mut *conn, table, &local_id).await?;
            mutation
        }
        QueueMutation::Create { snapshot } | QueueMutation::Update { snapshot } => {
            let open: Option<QueueRow> = sqlx::query_as(&format!(
                "{} WHERE entity_table = ?1 AND entity_local_id = ?2 AND status = 'pending' \
                 AND operation IN ('create', 'update') \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                SELECT_ITEM
            ))
            .bind(table)
            .bind(&local_id)
            .fetch_optional(&mut *conn)
            .await?;

            if let Some(row) = open {
                let mut item = QueueItem::try_from(row)?;
                item.payload = match item.operation {
                    Operation::Create => QueueMutation::Create { snapshot },
                    _ => QueueMutation::Update { snapshot },
                };
                let payload = serde_json::to_string(&item.payload)?;
                sqlx::query("UPDATE queue_items SET payload = ?1 WHERE id = ?2")
                    .bind(payload)
                    .bind(&item.id)
                    .execute(&mut *conn)
                    .await?;

                debug!(queue_item = %item.id, entity_table = %table, "Coalesced into pending item");
                return Ok(item);
            }

            if snapshot.remote_id().is_none() {
                QueueMutation::Create { snapshot }
            } else {
                QueueMutation::Update { snapshot }
            }
        }
    };

    let item = QueueItem::new(mutation);
    enqueue_on(&mut *conn, &item).await?;

    debug!(
        queue_item = %item.id,
        entity_table = %item.entity_table,
        operation = item.operation.as_str(),
        "Enqueued change"
    );
    Ok(item)
}

/// Removes not-yet-pushed items for a row (pending or dead-lettered).
pub async fn drop_pending_for_entity_on(
    conn: &mut SqliteConnection,
    table: EntityTable,
    local_id: &str,
) -> DbResult<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM queue_items
        WHERE entity_table = ?1 AND entity_local_id = ?2 AND status IN ('pending', 'failed')
        "#,
    )
    .bind(table)
    .bind(local_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Number of items other than `except_id` still pending or processing for a row.
pub async fn open_items_for_entity_on(
    conn: &mut SqliteConnection,
    table: EntityTable,
    local_id: &str,
    except_id: Option<&str>,
) -> DbResult<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM queue_items
        WHERE entity_table = ?1 AND entity_local_id = ?2
          AND status IN ('pending', 'processing')
          AND id != COALESCE(?3, '')
        "#,
    )
    .bind(table)
    .bind(local_id)
    .bind(except_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for Change Queue operations.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    /// Creates a new QueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        QueueRepository { pool }
    }

    /// Appends an item. Re-submitting an existing id changes nothing.
    pub async fn enqueue(&self, item: &QueueItem) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        enqueue_on(&mut *conn, item).await
    }

    /// Returns up to `limit` due items in dequeue order.
    ///
    /// ## Ordering
    /// ```text
    /// ORDER BY priority (high, normal, low),
    ///          retry_count ASC,
    ///          created_at ASC,
    ///          rowid ASC          ← insertion order inside one transaction
    /// ```
    /// Items are not claimed here; call [`QueueRepository::mark_processing`]
    /// per item before pushing it.
    pub async fn dequeue_batch(&self, limit: i64, now: DateTime<Utc>) -> DbResult<Vec<QueueItem>> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            r#"{}
            WHERE status = 'pending' AND next_attempt_at <= ?1
            ORDER BY
                CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
                retry_count ASC,
                created_at ASC,
                rowid ASC
            LIMIT ?2
            "#,
            SELECT_ITEM
        ))
        .bind(now.timestamp_millis())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_items(rows)
    }

    /// Gets an item by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<QueueItem>> {
        let row: Option<QueueRow> = sqlx::query_as(&format!("{} WHERE id = ?1", SELECT_ITEM))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueueItem::try_from).transpose()
    }

    /// All items for one row, oldest first.
    pub async fn items_for_entity(&self, table: EntityTable, local_id: &str) -> DbResult<Vec<QueueItem>> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "{} WHERE entity_table = ?1 AND entity_local_id = ?2 ORDER BY created_at, rowid",
            SELECT_ITEM
        ))
        .bind(table)
        .bind(local_id)
        .fetch_all(&self.pool)
        .await?;

        into_items(rows)
    }

    /// Claims an item for pushing.
    ///
    /// ## Returns
    /// `false` if the item is no longer `pending` (already completed, failed,
    /// or claimed), in which case the caller must skip it.
    pub async fn mark_processing(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items SET status = 'processing', last_attempt_at = ?2
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Marks an item as pushed.
    pub async fn mark_completed(&self, id: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_items SET status = 'completed', error = NULL
            WHERE id = ?1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a retryable failure.
    ///
    /// ## Behavior
    /// ```text
    /// retry_count += 1
    ///   retry_count <  5  → pending, next_attempt_at = now + BACKOFF[old retry_count]
    ///   retry_count == 5  → failed (terminal)
    /// ```
    /// Items already `failed` or `completed` are left unchanged.
    ///
    /// ## Returns
    /// The item after the transition.
    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<QueueItem> {
        let mut tx = self.pool.begin().await?;

        let row: QueueRow = sqlx::query_as(&format!("{} WHERE id = ?1", SELECT_ITEM))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::not_found("QueueItem", id))?;
        let mut item = QueueItem::try_from(row)?;

        if matches!(item.status, QueueStatus::Failed | QueueStatus::Completed) {
            return Ok(item);
        }

        let now = Utc::now();
        let backoff = backoff_for(item.retry_count);
        item.retry_count = (item.retry_count + 1).min(MAX_RETRIES);
        item.last_attempt_at = Some(now);
        item.next_attempt_at = now + backoff;
        item.error = Some(error.to_string());
        item.status = if item.retry_count >= MAX_RETRIES {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        };

        sqlx::query(
            r#"
            UPDATE queue_items SET
                retry_count = ?2, status = ?3, last_attempt_at = ?4,
                next_attempt_at = ?5, error = ?6
            WHERE id = ?1
            "#,
        )
        .bind(&item.id)
        .bind(item.retry_count)
        .bind(item.status)
        .bind(item.last_attempt_at)
        .bind(item.next_attempt_at.timestamp_millis())
        .bind(&item.error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if item.is_terminal() {
            warn!(
                queue_item = %item.id,
                entity_table = %item.entity_table,
                retry_count = item.retry_count,
                "Queue item exhausted retries"
            );
        } else {
            debug!(
                queue_item = %item.id,
                retry_count = item.retry_count,
                backoff_secs = backoff.num_seconds(),
                "Queue item will retry"
            );
        }
        Ok(item)
    }

    /// Dead-letters an item the authority rejected. No retry.
    pub async fn mark_rejected(&self, id: &str, error: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_items SET status = 'failed', error = ?2, last_attempt_at = ?3
            WHERE id = ?1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        warn!(queue_item = %id, error = %error, "Queue item rejected by authority");
        Ok(())
    }

    /// Puts an item back to `pending` until `until` without counting an
    /// attempt. Used when a referenced parent has not been pushed yet.
    pub async fn defer(&self, id: &str, until: DateTime<Utc>, reason: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_items SET status = 'pending', next_attempt_at = ?2, error = ?3
            WHERE id = ?1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(until.timestamp_millis())
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Counts items by status.
    pub async fn stats(&self) -> DbResult<QueueStats> {
        let rows: Vec<(QueueStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue_items GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status {
                QueueStatus::Pending => stats.pending = count,
                QueueStatus::Processing => stats.processing = count,
                QueueStatus::Failed => stats.failed = count,
                QueueStatus::Completed => stats.completed = count,
            }
        }
        Ok(stats)
    }

    /// Counts never-attempted pending items enqueued after `since`.
    pub async fn fresh_pending_since(&self, since: DateTime<Utc>) -> DbResult<i64> {
        let count = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM queue_items
            WHERE status = 'pending' AND last_attempt_at IS NULL AND next_attempt_at > ?1
            "#,
        )
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Returns items left `processing` by a crash to `pending`.
    pub async fn recover_stale(&self) -> DbResult<u64> {
        let result = sqlx::query("UPDATE queue_items SET status = 'pending' WHERE status = 'processing'")
            .execute(&self.pool)
            .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(recovered, "Recovered stale queue items");
        }
        Ok(recovered)
    }

    /// Lists dead-lettered items, oldest first.
    pub async fn failed_items(&self) -> DbResult<Vec<QueueItem>> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "{} WHERE status = 'failed' ORDER BY created_at, rowid",
            SELECT_ITEM
        ))
        .fetch_all(&self.pool)
        .await?;

        into_items(rows)
    }

    /// Manually revives a dead-lettered item with a fresh retry budget.
    ///
    /// ## Returns
    /// `false` if the item is not `failed`.
    pub async fn requeue_failed(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items SET status = 'pending', retry_count = 0, error = NULL,
                next_attempt_at = ?2
            WHERE id = ?1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes completed items older than `days`.
    pub async fn purge_completed(&self, days: i64) -> DbResult<u64> {
        let cutoff = Utc::now() - Duration::days(days);

        let result = sqlx::query(
            r#"
            DELETE FROM queue_items
            WHERE status = 'completed' AND COALESCE(last_attempt_at, created_at) < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
