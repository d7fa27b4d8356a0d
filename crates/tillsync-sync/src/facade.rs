//! # Sync Facade
//!
//! The one surface the UI layer talks to.
//!
//! ## Read / Write Policy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  read(table, filter, local_only)                                        │
//! │     local_only or link down ──────────────► Local Store   (local)       │
//! │     otherwise: list from authority                                      │
//! │        ok  → apply to Local Store → Local Store   (remote)               │
//! │        err → Local Store                  (remote_fallback_to_local)    │
//! │                                                                         │
//! │  write(snapshot)                                                        │
//! │     Local Store insert/update + queue item (one transaction)            │
//! │     → { local_id, will_sync }      never waits for the network          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## UI Events
//! [`SyncFacade::spawn_event_bridge`] folds orchestrator, queue and monitor
//! signals into `syncStatusChanged`, `syncQueueUpdated` and
//! `conflictsResolved` calls on a [`SyncEventEmitter`].

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tillsync_core::{
    ConflictRecord, ConflictsResolved, DataSource, EntitySnapshot, EntityTable, NewSale, QueueItem, QueueStats,
    SyncRun, SyncStatusUpdate, SyncTrigger,
};
use tillsync_db::{Database, EntityFilter, RecordedSale};

use crate::error::{SyncError, SyncResult};
use crate::mirror::apply_remote_records;
use crate::orchestrator::{SyncEvent, SyncOrchestrator};

// =============================================================================
// Results
// =============================================================================

/// Rows returned by [`SyncFacade::read`] and where they came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    pub data: Vec<EntitySnapshot>,
    pub source: DataSource,
}

/// Outcome of a local write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub local_id: String,
    /// A queue item will carry this change to the authority.
    pub will_sync: bool,
}

// =============================================================================
// Event Emitter
// =============================================================================

/// Receives the UI events.
///
/// ## Implementors
/// - [`NoOpEmitter`] - headless use and tests
/// - [`TracingEmitter`] - writes events to the log
/// - the UI shell's own bridge
pub trait SyncEventEmitter: Send + Sync {
    /// `syncStatusChanged`
    fn emit_status(&self, status: &SyncStatusUpdate);

    /// `syncQueueUpdated`
    fn emit_queue(&self, stats: &QueueStats);

    /// `conflictsResolved`
    fn emit_conflicts(&self, resolved: &ConflictsResolved);
}

/// Discards every event.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatusUpdate) {}
    fn emit_queue(&self, _stats: &QueueStats) {}
    fn emit_conflicts(&self, _resolved: &ConflictsResolved) {}
}

/// Logs every event at `info`.
pub struct TracingEmitter;

impl SyncEventEmitter for TracingEmitter {
    fn emit_status(&self, status: &SyncStatusUpdate) {
        info!(
            is_online = status.is_online,
            sync_in_progress = status.sync_in_progress,
            pending = status.pending_item_count,
            last_sync_at = ?status.last_sync_at,
            "syncStatusChanged"
        );
    }

    fn emit_queue(&self, stats: &QueueStats) {
        info!(
            pending = stats.pending,
            processing = stats.processing,
            failed = stats.failed,
            completed = stats.completed,
            "syncQueueUpdated"
        );
    }

    fn emit_conflicts(&self, resolved: &ConflictsResolved) {
        info!(count = resolved.count, details = ?resolved.details, "conflictsResolved");
    }
}

// =============================================================================
// Facade
// =============================================================================

/// Read/write entry point for the UI. Cheap to clone.
#[derive(Clone)]
pub struct SyncFacade {
    orchestrator: SyncOrchestrator,
}

impl SyncFacade {
    pub fn new(orchestrator: SyncOrchestrator) -> Self {
        SyncFacade { orchestrator }
    }

    fn db(&self) -> &Database {
        self.orchestrator.db()
    }

    /// Reads rows of `table`.
    ///
    /// ## Arguments
    /// * `filter` - Predicates applied to the Local Store query
    /// * `local_only` - Skip the authority even when online
    ///
    /// ## Returns
    /// Rows from the Local Store and the [`DataSource`] that fed them. Only
    /// a failing Local Store surfaces as an error.
    pub async fn read(&self, table: EntityTable, filter: &EntityFilter, local_only: bool) -> SyncResult<ReadResult> {
        if local_only || !self.orchestrator.monitor().is_link_up() {
            return Ok(ReadResult {
                data: self.db().query_snapshots(table, filter).await?,
                source: DataSource::Local,
            });
        }

        let source = match self.refresh(table).await {
            Ok(()) => DataSource::Remote,
            Err(e) => {
                warn!(entity_table = %table, error = %e, "Remote read failed, serving local copy");
                DataSource::RemoteFallbackToLocal
            }
        };

        Ok(ReadResult {
            data: self.db().query_snapshots(table, filter).await?,
            source,
        })
    }

    /// Mirrors the authority's full collection into the Local Store.
    async fn refresh(&self, table: EntityTable) -> SyncResult<()> {
        let limit = self.orchestrator.settings().request_timeout;
        let records = tokio::time::timeout(limit, self.orchestrator.authority().list_since(table, None))
            .await
            .map_err(|_| SyncError::Timeout {
                operation: "read".into(),
                secs: limit.as_secs(),
            })??;

        let outcome = apply_remote_records(self.db(), table, &records).await?;
        debug!(entity_table = %table, applied = outcome.applied, "Refreshed from authority");
        Ok(())
    }

    /// Commits a record locally and queues it.
    ///
    /// A snapshot whose local id names an existing row updates that row;
    /// anything else is inserted.
    pub async fn write(&self, snapshot: EntitySnapshot) -> SyncResult<WriteResult> {
        let table = snapshot.table();
        let exists = !snapshot.local_id().is_empty()
            && self
                .db()
                .get_snapshot(table, snapshot.local_id())
                .await?
                .is_some();

        let local_id = if exists {
            self.db().update_snapshot(snapshot).await?.local_id().to_string()
        } else {
            self.db().insert_snapshot(snapshot).await?
        };

        self.changed().await;
        Ok(WriteResult {
            local_id,
            will_sync: true,
        })
    }

    /// Deletes a row. `will_sync` is false for a row the authority never saw.
    pub async fn remove(&self, table: EntityTable, local_id: &str) -> SyncResult<WriteResult> {
        let will_sync = self.db().delete_in(table, local_id).await?;
        self.changed().await;
        Ok(WriteResult {
            local_id: local_id.to_string(),
            will_sync,
        })
    }

    /// Records a sale, its items and the stock decrements in one transaction.
    pub async fn create_sale(&self, sale: NewSale) -> SyncResult<RecordedSale> {
        let recorded = self.db().create_sale(sale).await?;
        self.changed().await;
        Ok(recorded)
    }

    async fn changed(&self) {
        let queue = self.orchestrator.queue();
        queue.notify_pending();
        queue.publish_stats().await;
    }

    /// Runs a sync now. `None` means one was already running.
    pub async fn force_sync(&self) -> SyncResult<Option<SyncRun>> {
        self.orchestrator.run_once(SyncTrigger::Forced).await
    }

    /// Pauses automatic syncing while the app is in the background.
    pub fn set_background(&self, background: bool) {
        self.orchestrator.set_suppressed(background);
    }

    // =========================================================================
    // Status & Diagnostics
    // =========================================================================

    pub async fn status(&self) -> SyncResult<SyncStatusUpdate> {
        let in_progress = self.orchestrator.is_running();
        self.status_with(in_progress).await
    }

    async fn status_with(&self, sync_in_progress: bool) -> SyncResult<SyncStatusUpdate> {
        let stats = self.orchestrator.queue().stats().await?;
        let last = self.db().sync_runs().last_successful().await?;

        Ok(SyncStatusUpdate {
            is_online: self.orchestrator.monitor().is_link_up(),
            sync_in_progress,
            pending_item_count: stats.pending,
            last_sync_at: last.map(|run| run.completed_at),
        })
    }

    pub async fn queue_stats(&self) -> SyncResult<QueueStats> {
        self.orchestrator.queue().stats().await
    }

    /// Dead letters awaiting manual review.
    pub async fn failed_items(&self) -> SyncResult<Vec<QueueItem>> {
        self.orchestrator.queue().failed_items().await
    }

    pub async fn requeue_failed(&self, id: &str) -> SyncResult<bool> {
        self.orchestrator.queue().requeue_failed(id).await
    }

    pub async fn recent_conflicts(&self, limit: i64) -> SyncResult<Vec<ConflictRecord>> {
        Ok(self.db().conflicts().recent(limit).await?)
    }

    pub async fn recent_runs(&self, limit: i64) -> SyncResult<Vec<SyncRun>> {
        Ok(self.db().sync_runs().recent(limit).await?)
    }

    // =========================================================================
    // Event Bridge
    // =========================================================================

    /// Forwards events to `emitter` until the sources close. Status updates
    /// are only emitted when they change.
    pub fn spawn_event_bridge(&self, emitter: Arc<dyn SyncEventEmitter>) -> JoinHandle<()> {
        let facade = self.clone();
        let mut sync_events = self.orchestrator.subscribe();
        let mut queue_events = self.orchestrator.queue().subscribe_stats();
        let mut link = self.orchestrator.monitor().watch_state();

        tokio::spawn(async move {
            let mut last: Option<SyncStatusUpdate> = None;
            let in_progress = facade.orchestrator.is_running();
            facade.emit_status_if_changed(&*emitter, &mut last, in_progress).await;

            loop {
                let in_progress = tokio::select! {
                    event = sync_events.recv() => match event {
                        Ok(SyncEvent::RunStarted(_)) => true,
                        Ok(SyncEvent::RunFinished(_)) => false,
                        Ok(SyncEvent::ConflictsResolved(resolved)) => {
                            emitter.emit_conflicts(&resolved);
                            continue;
                        }
                        Ok(SyncEvent::Skipped(_)) => continue,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Sync events lagged");
                            facade.orchestrator.is_running()
                        }
                        Err(RecvError::Closed) => break,
                    },

                    stats = queue_events.recv() => match stats {
                        Ok(stats) => {
                            emitter.emit_queue(&stats);
                            facade.orchestrator.is_running()
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },

                    changed = link.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        facade.orchestrator.is_running()
                    }
                };

                facade.emit_status_if_changed(&*emitter, &mut last, in_progress).await;
            }

            debug!("Event bridge stopped");
        })
    }

    async fn emit_status_if_changed(
        &self,
        emitter: &dyn SyncEventEmitter,
        last: &mut Option<SyncStatusUpdate>,
        in_progress: bool,
    ) {
        match self.status_with(in_progress).await {
            Ok(status) => {
                if last.as_ref() != Some(&status) {
                    emitter.emit_status(&status);
                    *last = Some(status);
                }
            }
            Err(e) => warn!(error = %e, "Failed to compute sync status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{encode_record, RemoteAuthority, RemoteRecord};
    use crate::conflict::ConflictResolver;
    use crate::monitor::{NetworkMonitor, Prober};
    use crate::orchestrator::OrchestratorSettings;
    use crate::queue::ChangeQueue;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::{Map, Value};
    use std::sync::Mutex;
    use std::time::Duration;
    use tillsync_core::{ConflictPolicy, Product, SyncRecord, SyncStatus};
    use tillsync_db::DbConfig;

    /// Serves a fixed catalog, or fails every call.
    struct Catalog {
        products: Vec<RemoteRecord>,
        down: bool,
    }

    #[async_trait]
    impl RemoteAuthority for Catalog {
        async fn list_since(&self, table: EntityTable, _: Option<DateTime<Utc>>) -> SyncResult<Vec<RemoteRecord>> {
            if self.down {
                return Err(SyncError::Unreachable("503: maintenance".into()));
            }
            Ok(match table {
                EntityTable::Products => self.products.clone(),
                _ => Vec::new(),
            })
        }
        async fn create(&self, _: EntityTable, _: &str, _: &Map<String, Value>) -> SyncResult<RemoteRecord> {
            Err(SyncError::Unreachable("offline".into()))
        }
        async fn update(&self, _: EntityTable, _: &str, _: &Map<String, Value>) -> SyncResult<RemoteRecord> {
            Err(SyncError::Unreachable("offline".into()))
        }
        async fn delete(&self, _: EntityTable, _: &str) -> SyncResult<()> {
            Ok(())
        }
    }

    struct Always;

    #[async_trait]
    impl Prober for Always {
        async fn probe(&self, _: &str) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct Recording {
        statuses: Mutex<Vec<SyncStatusUpdate>>,
        queues: Mutex<Vec<QueueStats>>,
    }

    impl SyncEventEmitter for Recording {
        fn emit_status(&self, status: &SyncStatusUpdate) {
            self.statuses.lock().unwrap().push(status.clone());
        }
        fn emit_queue(&self, stats: &QueueStats) {
            self.queues.lock().unwrap().push(stats.clone());
        }
        fn emit_conflicts(&self, _: &ConflictsResolved) {}
    }

    async fn facade(link_up: bool, down: bool) -> SyncFacade {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let catalog = Catalog {
            products: vec![RemoteRecord {
                remote_id: "rp-1".into(),
                updated_at: Utc::now(),
                deleted: false,
                fields: encode_record(&Product::new("TEA-1", "Green Tea", 450, 12)).unwrap(),
            }],
            down,
        };
        let monitor = Arc::new(NetworkMonitor::new(Arc::new(Always), vec!["probe".into()], link_up));
        let queue = ChangeQueue::new(&db, 10);
        let resolver = ConflictResolver::new(db.clone(), ConflictPolicy::default());
        let orchestrator = SyncOrchestrator::new(
            db,
            Arc::new(catalog),
            monitor,
            queue,
            resolver,
            OrchestratorSettings::default(),
        );
        SyncFacade::new(orchestrator)
    }

    #[tokio::test]
    async fn test_offline_write_commits_and_queues() {
        let facade = facade(false, false).await;

        let written = facade
            .write(Product::new("COKE-330", "Coca-Cola 330ml", 150, 24).into_snapshot())
            .await
            .unwrap();
        assert!(written.will_sync);

        let status = facade.status().await.unwrap();
        assert!(!status.is_online);
        assert_eq!(status.pending_item_count, 1);
        assert_eq!(status.last_sync_at, None);

        let read = facade
            .read(EntityTable::Products, &EntityFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(read.source, DataSource::Local);
        assert_eq!(read.data.len(), 1);
    }

    #[tokio::test]
    async fn test_write_of_existing_row_updates_it() {
        let facade = facade(false, false).await;
        let first = facade
            .write(Product::new("COKE-330", "Coca-Cola 330ml", 150, 24).into_snapshot())
            .await
            .unwrap();

        let mut product: Product = facade.db().get(&first.local_id).await.unwrap().unwrap();
        product.price_cents = 175;
        let second = facade.write(product.into_snapshot()).await.unwrap();

        assert_eq!(first.local_id, second.local_id);
        let stored: Product = facade.db().get(&first.local_id).await.unwrap().unwrap();
        assert_eq!(stored.price_cents, 175);
        assert_eq!(facade.queue_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_online_read_refreshes_from_authority() {
        let facade = facade(true, false).await;
        let read = facade
            .read(EntityTable::Products, &EntityFilter::default(), false)
            .await
            .unwrap();

        assert_eq!(read.source, DataSource::Remote);
        assert_eq!(read.data.len(), 1);
        assert_eq!(read.data[0].remote_id(), Some("rp-1"));

        let local_only = facade
            .read(EntityTable::Products, &EntityFilter::with_status(SyncStatus::Synced), true)
            .await
            .unwrap();
        assert_eq!(local_only.source, DataSource::Local);
        assert_eq!(local_only.data.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_remote_read_falls_back_to_local() {
        let facade = facade(true, true).await;
        let read = facade
            .read(EntityTable::Products, &EntityFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(read.source, DataSource::RemoteFallbackToLocal);
        assert!(read.data.is_empty());
    }

    #[tokio::test]
    async fn test_bridge_emits_queue_and_status() {
        let facade = facade(false, false).await;
        let recording = Arc::new(Recording::default());
        let bridge = facade.spawn_event_bridge(recording.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        facade
            .write(Product::new("COKE-330", "Coca-Cola 330ml", 150, 24).into_snapshot())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        bridge.abort();

        let queues = recording.queues.lock().unwrap();
        assert_eq!(queues.last().map(|s| s.pending), Some(1));
        let statuses = recording.statuses.lock().unwrap();
        assert_eq!(statuses.first().map(|s| s.pending_item_count), Some(0));
        assert_eq!(statuses.last().map(|s| s.pending_item_count), Some(1));
    }
}
