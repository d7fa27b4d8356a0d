//! # Conflict Resolver
//!
//! Finds rows the pull phase flagged `conflict` and settles each one with
//! the table's configured strategy.
//!
//! ## Resolution Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  find_conflicts()                                                       │
//! │    local rows with status = conflict                                    │
//! │         │                                                               │
//! │         ├── no shadow / no divergence left ──► back to pending|synced   │
//! │         ▼                                                               │
//! │    Conflict { local, remote (shadow), diverging_fields }                │
//! │                                                                         │
//! │  resolve(conflict)        (once per pair per cycle)                     │
//! │    one transaction:                                                     │
//! │      1. audit record  (ConflictRecord, immutable)                       │
//! │      2. write resolved row                                              │
//! │           ├── equals remote → synced, drop queued pushes                │
//! │           └── differs       → pending, enqueue update                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The shadow is left as the authority's copy. A local win is pushed as an
//! ordinary update on the next run.

use chrono::Utc;
use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use tillsync_core::{
    resolve_pair, Conflict, ConflictPolicy, ConflictRecord, EntitySnapshot, EntityTable,
    QueueMutation, SyncRecord, SyncStatus, Winner,
};
use tillsync_db::repository::conflict::insert_conflict_on;
use tillsync_db::repository::queue::{drop_pending_for_entity_on, enqueue_change_on, open_items_for_entity_on};
use tillsync_db::store::{set_sync_state, upsert_row};
use tillsync_db::{with_entity_type, Database, EntityFilter, StoredEntity};

use crate::error::SyncResult;

/// What a resolution wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The audit entry, as stored.
    pub record: ConflictRecord,
    /// The row as written back to the Local Store.
    pub snapshot: EntitySnapshot,
    pub winner: Winner,
}

/// Applies the per-table [`ConflictPolicy`].
pub struct ConflictResolver {
    db: Database,
    policy: ConflictPolicy,
    /// Pairs already resolved in the current cycle.
    resolved: Mutex<HashSet<(EntityTable, String)>>,
}

impl ConflictResolver {
    pub fn new(db: Database, policy: ConflictPolicy) -> Self {
        ConflictResolver {
            db,
            policy,
            resolved: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Starts a new cycle: every pair may be resolved once again.
    pub fn begin_cycle(&self) {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    // =========================================================================
    // Detection
    // =========================================================================

    /// Lists unresolved conflicts across all tables, parents first.
    ///
    /// Flagged rows whose divergence has disappeared since the pull (or whose
    /// shadow is gone) are returned to `pending`/`synced` instead.
    pub async fn find_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        let mut found = Vec::new();
        for table in EntityTable::ALL {
            with_entity_type!(table, E => self.conflicts_in::<E>(&mut found).await?);
        }
        Ok(found)
    }

    async fn conflicts_in<E: StoredEntity>(&self, found: &mut Vec<Conflict>) -> SyncResult<()> {
        let flagged: Vec<E> = self
            .db
            .query(&EntityFilter::with_status(SyncStatus::Conflict))
            .await?;

        for local in flagged {
            let remote_id = match local.remote_id() {
                Some(remote_id) => remote_id.to_string(),
                None => {
                    self.settle::<E>(local.id()).await?;
                    continue;
                }
            };

            let shadow = match self.db.shadows().get(E::TABLE, &remote_id).await? {
                Some(shadow) => shadow,
                None => {
                    self.settle::<E>(local.id()).await?;
                    continue;
                }
            };

            let remote = E::from_snapshot(shadow.snapshot)?;
            let diverging = local.diverging_fields(&remote);
            if diverging.is_empty() {
                self.settle::<E>(local.id()).await?;
                continue;
            }

            found.push(Conflict {
                entity_table: E::TABLE,
                remote_id,
                local: local.into_snapshot(),
                remote: remote.into_snapshot(),
                diverging_fields: diverging.into_iter().map(String::from).collect(),
            });
        }
        Ok(())
    }

    /// Clears a stale conflict flag.
    async fn settle<E: StoredEntity>(&self, local_id: &str) -> SyncResult<()> {
        let local_id = local_id.to_string();
        self.db
            .transaction(move |conn: &mut SqliteConnection| {
                Box::pin(async move {
                    let open = open_items_for_entity_on(&mut *conn, E::TABLE, &local_id, None).await?;
                    let status = if open > 0 {
                        SyncStatus::Pending
                    } else {
                        SyncStatus::Synced
                    };
                    set_sync_state(&mut *conn, E::TABLE, &local_id, None, status).await?;
                    debug!(entity_table = %E::TABLE, local_id = %local_id, status = ?status, "Cleared stale conflict");
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Resolves one conflict.
    ///
    /// ## Returns
    /// `None` when this pair was already resolved in the current cycle.
    pub async fn resolve(&self, conflict: &Conflict) -> SyncResult<Option<Resolution>> {
        {
            let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
            if !resolved.insert(conflict.pair_key()) {
                debug!(
                    entity_table = %conflict.entity_table,
                    remote_id = %conflict.remote_id,
                    "Conflict already resolved this cycle"
                );
                return Ok(None);
            }
        }

        let strategy = self.policy.strategy_for(conflict.entity_table);
        let record = ConflictRecord::from_conflict(conflict, strategy);

        let resolution = with_entity_type!(conflict.entity_table, E => {
            self.apply::<E>(conflict, record).await?
        });

        info!(
            entity_table = %conflict.entity_table,
            remote_id = %conflict.remote_id,
            strategy = strategy.as_str(),
            winner = ?resolution.winner,
            fields = ?conflict.diverging_fields,
            "Resolved conflict"
        );
        Ok(Some(resolution))
    }

    async fn apply<E: StoredEntity>(&self, conflict: &Conflict, record: ConflictRecord) -> SyncResult<Resolution> {
        let local = E::from_snapshot(conflict.local.clone())?;
        let remote = E::from_snapshot(conflict.remote.clone())?;
        let (mut resolved, winner) = resolve_pair(&local, &remote, record.strategy_applied);

        match winner {
            Winner::Remote => resolved.set_sync_status(SyncStatus::Synced),
            Winner::Local => {
                resolved.set_sync_status(SyncStatus::Pending);
                resolved.set_updated_at(Utc::now());
            }
        }

        let audit = record.clone();
        let written = resolved.clone();
        self.db
            .transaction(move |conn: &mut SqliteConnection| {
                Box::pin(async move {
                    insert_conflict_on(&mut *conn, &audit).await?;
                    upsert_row(&mut *conn, &written).await?;

                    match winner {
                        Winner::Remote => {
                            drop_pending_for_entity_on(&mut *conn, E::TABLE, written.id()).await?;
                        }
                        Winner::Local => {
                            enqueue_change_on(
                                &mut *conn,
                                QueueMutation::Update {
                                    snapshot: written.clone().into_snapshot(),
                                },
                            )
                            .await?;
                        }
                    }
                    Ok(())
                })
            })
            .await?;

        Ok(Resolution {
            record,
            snapshot: resolved.into_snapshot(),
            winner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_core::{ConflictStrategy, MovementReason, Product, StockMovement};
    use tillsync_db::DbConfig;

    /// Stores `mirrored` as a synced row, applies `edit` locally, records
    /// `upstream` as the shadow and flags the row the way a pull would.
    async fn flag_conflict<E, F>(db: &Database, mirrored: E, edit: F, upstream: E)
    where
        E: StoredEntity,
        F: FnOnce(&mut E) + Send,
    {
        let local_id = mirrored.id().to_string();
        let remote_id = mirrored.remote_id().unwrap().to_string();

        db.transaction(move |conn: &mut SqliteConnection| {
            Box::pin(async move { tillsync_db::store::insert_row(&mut *conn, &mirrored).await })
        })
        .await
        .unwrap();

        db.update::<E, _>(&local_id, edit).await.unwrap();
        db.shadows().upsert(&remote_id, &upstream.into_snapshot()).await.unwrap();

        db.transaction(move |conn: &mut SqliteConnection| {
            Box::pin(async move { set_sync_state(&mut *conn, E::TABLE, &local_id, None, SyncStatus::Conflict).await })
        })
        .await
        .unwrap();
    }

    fn synced<E: SyncRecord>(mut record: E, remote_id: &str) -> E {
        record.set_remote_id(Some(remote_id.into()));
        record.set_sync_status(SyncStatus::Synced);
        record
    }

    /// A mirrored product at $11, edited locally to $10, while the authority
    /// moved to $12.
    async fn diverged(db: &Database) -> Product {
        let mirrored = synced(Product::new("COKE-330", "Coca-Cola 330ml", 1100, 20), "rp-1");
        let mut upstream = mirrored.clone();
        upstream.price_cents = 1200;
        flag_conflict(db, mirrored.clone(), |p: &mut Product| p.price_cents = 1000, upstream).await;
        mirrored
    }

    /// A mirrored restock of 12 whose delta was recounted locally to 10, while
    /// the authority annotated it. `upstream_age` shifts the authority's
    /// timestamp relative to the mirror.
    async fn diverged_movement(db: &Database, upstream_age: chrono::Duration) -> StockMovement {
        let product = synced(Product::new("COKE-330", "Coca-Cola 330ml", 1100, 20), "rp-1");
        let product_id = product.id.clone();
        db.transaction(move |conn: &mut SqliteConnection| {
            Box::pin(async move { tillsync_db::store::insert_row(&mut *conn, &product).await })
        })
        .await
        .unwrap();

        let mut mirrored = synced(StockMovement::new(product_id, 12, MovementReason::Restock), "rm-1");
        mirrored.updated_at = Utc::now() - chrono::Duration::minutes(10);
        let mut upstream = mirrored.clone();
        upstream.note = Some("pallet 4".into());
        upstream.updated_at = Utc::now() + upstream_age;

        flag_conflict(db, mirrored.clone(), |m: &mut StockMovement| m.quantity_delta = 10, upstream).await;
        mirrored
    }

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_find_reports_diverging_fields() {
        let db = db().await;
        diverged(&db).await;
        let resolver = ConflictResolver::new(db.clone(), ConflictPolicy::default());

        let conflicts = resolver.find_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].remote_id, "rp-1");
        assert_eq!(conflicts[0].diverging_fields, vec!["price".to_string()]);
    }

    #[tokio::test]
    async fn test_server_wins_overwrites_and_drops_queued_push() {
        let db = db().await;
        let product = diverged(&db).await;
        let policy = ConflictPolicy::default().with(EntityTable::Products, ConflictStrategy::ServerWins);
        let resolver = ConflictResolver::new(db.clone(), policy);

        let conflicts = resolver.find_conflicts().await.unwrap();
        let resolution = resolver.resolve(&conflicts[0]).await.unwrap().unwrap();
        assert_eq!(resolution.winner, Winner::Remote);

        let row: Product = db.get(&product.id).await.unwrap().unwrap();
        assert_eq!(row.price_cents, 1200);
        assert_eq!(row.sync_status, SyncStatus::Synced);
        assert_eq!(db.queue().stats().await.unwrap().pending, 0);

        let audit = db.conflicts().for_record(EntityTable::Products, "rp-1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].strategy_applied, ConflictStrategy::ServerWins);
        assert_eq!(audit[0].diverging_fields, vec!["price".to_string()]);
    }

    #[tokio::test]
    async fn test_local_wins_queues_an_update() {
        let db = db().await;
        let product = diverged(&db).await;
        let policy = ConflictPolicy::default().with(EntityTable::Products, ConflictStrategy::LocalWins);
        let resolver = ConflictResolver::new(db.clone(), policy);

        let conflicts = resolver.find_conflicts().await.unwrap();
        let resolution = resolver.resolve(&conflicts[0]).await.unwrap().unwrap();
        assert_eq!(resolution.winner, Winner::Local);

        let row: Product = db.get(&product.id).await.unwrap().unwrap();
        assert_eq!(row.price_cents, 1000);
        assert_eq!(row.sync_status, SyncStatus::Pending);

        let items = db.queue().items_for_entity(EntityTable::Products, &product.id).await.unwrap();
        let queued = items.iter().filter(|i| !i.is_terminal()).count();
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn test_timestamp_wins_keeps_newer_local_row() {
        let db = db().await;
        let movement = diverged_movement(&db, -chrono::Duration::minutes(5)).await;
        let resolver = ConflictResolver::new(db.clone(), ConflictPolicy::default());

        let conflicts = resolver.find_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        let resolution = resolver.resolve(&conflicts[0]).await.unwrap().unwrap();
        assert_eq!(resolution.winner, Winner::Local);

        let row: StockMovement = db.get(&movement.id).await.unwrap().unwrap();
        assert_eq!(row.quantity_delta, 10);
        assert_eq!(row.note, None);
        assert_eq!(row.sync_status, SyncStatus::Pending);

        let items = db
            .queue()
            .items_for_entity(EntityTable::StockMovements, &movement.id)
            .await
            .unwrap();
        let open: Vec<_> = items.iter().filter(|i| !i.is_terminal()).collect();
        assert_eq!(open.len(), 1);
        let queued = StockMovement::from_snapshot(open[0].payload.snapshot().unwrap().clone()).unwrap();
        assert_eq!(queued.quantity_delta, 10);

        let audit = db.conflicts().for_record(EntityTable::StockMovements, "rm-1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].strategy_applied, ConflictStrategy::TimestampWins);
    }

    #[tokio::test]
    async fn test_timestamp_wins_takes_newer_remote_row() {
        let db = db().await;
        let movement = diverged_movement(&db, chrono::Duration::minutes(5)).await;
        let resolver = ConflictResolver::new(db.clone(), ConflictPolicy::default());

        let conflicts = resolver.find_conflicts().await.unwrap();
        let resolution = resolver.resolve(&conflicts[0]).await.unwrap().unwrap();
        assert_eq!(resolution.winner, Winner::Remote);

        let row: StockMovement = db.get(&movement.id).await.unwrap().unwrap();
        assert_eq!(row.quantity_delta, 12);
        assert_eq!(row.note.as_deref(), Some("pallet 4"));
        assert_eq!(row.sync_status, SyncStatus::Synced);
        assert_eq!(db.queue().stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_merge_keeps_local_stock_and_remote_catalog() {
        let db = db().await;
        let mirrored = synced(Product::new("COKE-330", "Coca-Cola 330ml", 1100, 20), "rp-1");
        let mut upstream = mirrored.clone();
        upstream.price_cents = 1200;
        upstream.name = "Coca-Cola 330ml Can".into();
        flag_conflict(&db, mirrored.clone(), |p: &mut Product| p.stock_quantity = 15, upstream).await;

        let policy = ConflictPolicy::default().with(EntityTable::Products, ConflictStrategy::Merge);
        let resolver = ConflictResolver::new(db.clone(), policy);

        let conflicts = resolver.find_conflicts().await.unwrap();
        assert_eq!(
            conflicts[0].diverging_fields,
            vec!["name".to_string(), "price".to_string(), "stock_quantity".to_string()]
        );
        let resolution = resolver.resolve(&conflicts[0]).await.unwrap().unwrap();
        assert_eq!(resolution.winner, Winner::Local);

        let row: Product = db.get(&mirrored.id).await.unwrap().unwrap();
        assert_eq!(row.stock_quantity, 15);
        assert_eq!(row.price_cents, 1200);
        assert_eq!(row.name, "Coca-Cola 330ml Can");
        assert_eq!(row.remote_id.as_deref(), Some("rp-1"));
        assert_eq!(row.sync_status, SyncStatus::Pending);

        let items = db.queue().items_for_entity(EntityTable::Products, &mirrored.id).await.unwrap();
        let open: Vec<_> = items.iter().filter(|i| !i.is_terminal()).collect();
        assert_eq!(open.len(), 1);
        let queued = Product::from_snapshot(open[0].payload.snapshot().unwrap().clone()).unwrap();
        assert_eq!((queued.price_cents, queued.stock_quantity), (1200, 15));

        let audit = db.conflicts().for_record(EntityTable::Products, "rp-1").await.unwrap();
        assert_eq!(audit[0].strategy_applied, ConflictStrategy::Merge);
    }

    #[tokio::test]
    async fn test_pair_is_resolved_once_per_cycle() {
        let db = db().await;
        diverged(&db).await;
        let resolver = ConflictResolver::new(db.clone(), ConflictPolicy::default());

        let conflicts = resolver.find_conflicts().await.unwrap();
        assert!(resolver.resolve(&conflicts[0]).await.unwrap().is_some());
        assert!(resolver.resolve(&conflicts[0]).await.unwrap().is_none());
        assert_eq!(db.conflicts().count().await.unwrap(), 1);

        resolver.begin_cycle();
        assert!(resolver.find_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_flag_is_cleared() {
        let db = db().await;
        let product = diverged(&db).await;
        db.shadows().delete(EntityTable::Products, "rp-1").await.unwrap();
        let resolver = ConflictResolver::new(db.clone(), ConflictPolicy::default());

        assert!(resolver.find_conflicts().await.unwrap().is_empty());
        let row: Product = db.get(&product.id).await.unwrap().unwrap();
        assert_eq!(row.sync_status, SyncStatus::Pending);
    }
}
