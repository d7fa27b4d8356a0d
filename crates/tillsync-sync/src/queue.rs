//! # Change Queue
//!
//! The sync engine's view of the durable outbound queue: bounded batches,
//! status transitions, and live statistics.
//!
//! Items are written by the Local Store in the same transaction as the row
//! change they describe; this type never creates sync intent on its own
//! except through [`ChangeQueue::enqueue`].
//!
//! ## Signals
//! ```text
//! ┌──────────────┐  notify_pending()   ┌──────────────────┐
//! │ Facade write │ ──────────────────► │ Notify           │──► orchestrator
//! └──────────────┘                     └──────────────────┘    (QueuePending)
//!
//! every transition ── publish_stats() ──► broadcast<QueueStats> ──► UI
//! ```

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

use tillsync_core::{QueueItem, QueueStats};
use tillsync_db::{Database, QueueRepository};

use crate::config::{MAX_BATCH_SIZE, MIN_BATCH_SIZE};
use crate::error::SyncResult;

const STATS_CHANNEL_CAPACITY: usize = 16;

/// Handle to the Change Queue. Cheap to clone.
#[derive(Clone)]
pub struct ChangeQueue {
    repo: QueueRepository,
    batch_size: i64,
    stats_tx: broadcast::Sender<QueueStats>,
    pending: Arc<Notify>,
}

impl ChangeQueue {
    /// Creates a queue over `db`, with `batch_size` clamped to 10..=50.
    pub fn new(db: &Database, batch_size: usize) -> Self {
        let clamped = batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        if clamped != batch_size {
            warn!(requested = batch_size, used = clamped, "Batch size out of range");
        }
        let (stats_tx, _) = broadcast::channel(STATS_CHANNEL_CAPACITY);

        ChangeQueue {
            repo: db.queue(),
            batch_size: clamped as i64,
            stats_tx,
            pending: Arc::new(Notify::new()),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size as usize
    }

    // =========================================================================
    // Queue Operations
    // =========================================================================

    /// Appends an item. Re-submitting an existing id changes nothing.
    pub async fn enqueue(&self, item: &QueueItem) -> SyncResult<bool> {
        let inserted = self.repo.enqueue(item).await?;
        if inserted {
            self.notify_pending();
            self.publish_stats().await;
        }
        Ok(inserted)
    }

    /// Up to one batch of items due now.
    pub async fn dequeue_batch(&self) -> SyncResult<Vec<QueueItem>> {
        self.dequeue_due(Utc::now()).await
    }

    /// Up to one batch of items due at `as_of`.
    ///
    /// The push phase passes its start time here so that items failing or
    /// arriving during the run wait for the next one.
    pub async fn dequeue_due(&self, as_of: DateTime<Utc>) -> SyncResult<Vec<QueueItem>> {
        Ok(self.repo.dequeue_batch(self.batch_size, as_of).await?)
    }

    /// Claims an item. `false` means skip it.
    pub async fn mark_processing(&self, id: &str) -> SyncResult<bool> {
        Ok(self.repo.mark_processing(id).await?)
    }

    pub async fn mark_completed(&self, id: &str) -> SyncResult<()> {
        self.repo.mark_completed(id).await?;
        debug!(queue_item = %id, "Queue item completed");
        Ok(())
    }

    /// Counts a failed attempt and schedules the retry (or dead-letters).
    pub async fn mark_failed(&self, id: &str, error: &str) -> SyncResult<QueueItem> {
        Ok(self.repo.mark_failed(id, error).await?)
    }

    /// Dead-letters without retry.
    pub async fn mark_rejected(&self, id: &str, error: &str) -> SyncResult<()> {
        Ok(self.repo.mark_rejected(id, error).await?)
    }

    /// Returns an item to `pending` until `until` without counting an attempt.
    pub async fn defer(&self, id: &str, until: DateTime<Utc>, reason: &str) -> SyncResult<()> {
        debug!(queue_item = %id, reason, "Deferring queue item");
        Ok(self.repo.defer(id, until, reason).await?)
    }

    pub async fn get(&self, id: &str) -> SyncResult<Option<QueueItem>> {
        Ok(self.repo.get(id).await?)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Resets items a crash left in `processing`.
    pub async fn recover_stale(&self) -> SyncResult<u64> {
        let recovered = self.repo.recover_stale().await?;
        if recovered > 0 {
            self.notify_pending();
        }
        Ok(recovered)
    }

    pub async fn failed_items(&self) -> SyncResult<Vec<QueueItem>> {
        Ok(self.repo.failed_items().await?)
    }

    /// Manual intervention: revives a dead letter with a fresh retry budget.
    pub async fn requeue_failed(&self, id: &str) -> SyncResult<bool> {
        let revived = self.repo.requeue_failed(id).await?;
        if revived {
            self.notify_pending();
            self.publish_stats().await;
        }
        Ok(revived)
    }

    pub async fn purge_completed(&self, days: i64) -> SyncResult<u64> {
        let purged = self.repo.purge_completed(days).await?;
        if purged > 0 {
            debug!(purged, days, "Purged completed queue items");
        }
        Ok(purged)
    }

    /// Never-attempted items that arrived after `since`.
    pub async fn fresh_pending_since(&self, since: DateTime<Utc>) -> SyncResult<i64> {
        Ok(self.repo.fresh_pending_since(since).await?)
    }

    // =========================================================================
    // Signals
    // =========================================================================

    pub async fn stats(&self) -> SyncResult<QueueStats> {
        Ok(self.repo.stats().await?)
    }

    /// Broadcasts the current counts. Failures are logged, not returned.
    pub async fn publish_stats(&self) {
        match self.repo.stats().await {
            Ok(stats) => {
                let _ = self.stats_tx.send(stats);
            }
            Err(e) => warn!(error = %e, "Failed to read queue stats"),
        }
    }

    pub fn subscribe_stats(&self) -> broadcast::Receiver<QueueStats> {
        self.stats_tx.subscribe()
    }

    /// Wakes the orchestrator: there is something to push.
    pub fn notify_pending(&self) {
        self.pending.notify_one();
    }

    /// The notifier [`ChangeQueue::notify_pending`] signals.
    pub fn pending_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tillsync_core::{Product, QueueMutation, QueueStatus, SyncRecord, MAX_RETRIES};
    use tillsync_db::DbConfig;

    async fn queue(batch_size: usize) -> (Database, ChangeQueue) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = ChangeQueue::new(&db, batch_size);
        (db, queue)
    }

    fn item(sku: &str) -> QueueItem {
        QueueItem::new(QueueMutation::Create {
            snapshot: Product::new(sku, "Thing", 100, 1).into_snapshot(),
        })
    }

    #[tokio::test]
    async fn test_batch_size_is_clamped() {
        let (_db, small) = queue(1).await;
        assert_eq!(small.batch_size(), 10);
        let (_db, large) = queue(500).await;
        assert_eq!(large.batch_size(), 50);
    }

    #[tokio::test]
    async fn test_batches_are_bounded() {
        let (_db, queue) = queue(10).await;
        for n in 0..15 {
            queue.enqueue(&item(&format!("SKU-{}", n))).await.unwrap();
        }
        assert_eq!(queue.dequeue_batch().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_enqueue_signals_pending_and_stats() {
        let (_db, queue) = queue(10).await;
        let mut stats = queue.subscribe_stats();
        let signal = queue.pending_signal();

        queue.enqueue(&item("A")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), signal.notified())
            .await
            .unwrap();
        assert_eq!(stats.recv().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_sixth_failure_is_terminal_and_not_dequeued() {
        let (db, queue) = queue(10).await;
        let item = item("A");
        queue.enqueue(&item).await.unwrap();

        let mut last = None;
        for _ in 0..MAX_RETRIES {
            sqlx::query("UPDATE queue_items SET next_attempt_at = 0 WHERE id = ?1")
                .bind(&item.id)
                .execute(db.pool())
                .await
                .unwrap();
            assert!(queue.mark_processing(&item.id).await.unwrap());
            last = Some(queue.mark_failed(&item.id, "unreachable").await.unwrap());
        }

        let last = last.unwrap();
        assert_eq!(last.status, QueueStatus::Failed);
        assert_eq!(last.retry_count, MAX_RETRIES);

        let again = queue.mark_failed(&item.id, "unreachable").await.unwrap();
        assert_eq!(again.retry_count, MAX_RETRIES);
        assert!(queue.dequeue_due(Utc::now() + chrono::Duration::days(1)).await.unwrap().is_empty());

        assert!(queue.requeue_failed(&item.id).await.unwrap());
        let revived = queue.get(&item.id).await.unwrap().unwrap();
        assert_eq!(revived.status, QueueStatus::Pending);
        assert_eq!(revived.retry_count, 0);
    }

    #[tokio::test]
    async fn test_recover_stale_returns_items_to_pending() {
        let (_db, queue) = queue(10).await;
        let item = item("A");
        queue.enqueue(&item).await.unwrap();
        queue.mark_processing(&item.id).await.unwrap();

        assert_eq!(queue.recover_stale().await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }
}
