//! # Entity Store
//!
//! Generic persistence for the five synced entity tables, and the Local Store
//! write contract (`insert`, `update`, `delete`, `query`).
//!
//! ## Write-Ahead Durability
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  db.insert(product) / db.update(id, patch) / db.delete(id)              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. INSERT / UPDATE / DELETE the entity row                    │   │
//! │  │     (sync_status = 'pending', updated_at = now)                │   │
//! │  │                                                                 │   │
//! │  │  2. enqueue QueueItem(table, op, snapshot)                     │   │
//! │  │     or refresh the still-pending item for the same row         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← the row change and its sync intent are never split           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The free functions take `&mut SqliteConnection` so that they compose inside
//! a caller's transaction (pull phase, conflict resolution, sale creation).

use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};
use tracing::debug;

use tillsync_core::{
    new_local_id, CashierOrder, EntitySnapshot, EntityTable, Product, QueueMutation, Sale,
    SaleItem, StockMovement, SyncRecord, SyncStatus,
};

use crate::error::{DbError, DbResult};
use crate::pool::Database;
use crate::repository::queue::{drop_pending_for_entity_on, enqueue_change_on};

/// A bound, not yet executed SQLite statement.
pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

// =============================================================================
// StoredEntity
// =============================================================================

/// A [`SyncRecord`] with a table in the Local Store.
pub trait StoredEntity: SyncRecord + for<'r> FromRow<'r, SqliteRow> {
    /// Column list in bind order.
    const COLUMNS: &'static str;

    /// `INSERT ... VALUES (?1, ...)` over [`StoredEntity::COLUMNS`].
    const INSERT_SQL: &'static str;

    /// `ON CONFLICT(id) DO UPDATE SET ...` clause appended for upserts.
    const UPSERT_CLAUSE: &'static str;

    /// Binds every column in [`StoredEntity::COLUMNS`] order.
    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;
}

impl StoredEntity for Product {
    const COLUMNS: &'static str =
        "id, remote_id, sku, name, price_cents, stock_quantity, is_active, sync_status, updated_at";
    const INSERT_SQL: &'static str = r#"
        INSERT INTO products (
            id, remote_id, sku, name, price_cents, stock_quantity, is_active, sync_status, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    "#;
    const UPSERT_CLAUSE: &'static str = r#"
        ON CONFLICT(id) DO UPDATE SET
            remote_id = excluded.remote_id,
            sku = excluded.sku,
            name = excluded.name,
            price_cents = excluded.price_cents,
            stock_quantity = excluded.stock_quantity,
            is_active = excluded.is_active,
            sync_status = excluded.sync_status,
            updated_at = excluded.updated_at
    "#;

    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id.clone())
            .bind(self.remote_id.clone())
            .bind(self.sku.clone())
            .bind(self.name.clone())
            .bind(self.price_cents)
            .bind(self.stock_quantity)
            .bind(self.is_active)
            .bind(self.sync_status)
            .bind(self.updated_at)
    }
}

impl StoredEntity for Sale {
    const COLUMNS: &'static str = "id, remote_id, receipt_number, cashier_id, subtotal_cents, \
         discount_cents, total_cents, payment_method, amount_tendered_cents, change_cents, \
         status, sync_status, created_at, updated_at";
    const INSERT_SQL: &'static str = r#"
        INSERT INTO sales (
            id, remote_id, receipt_number, cashier_id, subtotal_cents,
            discount_cents, total_cents, payment_method, amount_tendered_cents, change_cents,
            status, sync_status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
    "#;
    const UPSERT_CLAUSE: &'static str = r#"
        ON CONFLICT(id) DO UPDATE SET
            remote_id = excluded.remote_id,
            receipt_number = excluded.receipt_number,
            cashier_id = excluded.cashier_id,
            subtotal_cents = excluded.subtotal_cents,
            discount_cents = excluded.discount_cents,
            total_cents = excluded.total_cents,
            payment_method = excluded.payment_method,
            amount_tendered_cents = excluded.amount_tendered_cents,
            change_cents = excluded.change_cents,
            status = excluded.status,
            sync_status = excluded.sync_status,
            updated_at = excluded.updated_at
    "#;

    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id.clone())
            .bind(self.remote_id.clone())
            .bind(self.receipt_number.clone())
            .bind(self.cashier_id.clone())
            .bind(self.subtotal_cents)
            .bind(self.discount_cents)
            .bind(self.total_cents)
            .bind(self.payment_method)
            .bind(self.amount_tendered_cents)
            .bind(self.change_cents)
            .bind(self.status)
            .bind(self.sync_status)
            .bind(self.created_at)
            .bind(self.updated_at)
    }
}

impl StoredEntity for SaleItem {
    const COLUMNS: &'static str = "id, remote_id, sale_id, product_id, sku_snapshot, name_snapshot, \
         quantity, unit_price_cents, line_total_cents, sync_status, updated_at";
    const INSERT_SQL: &'static str = r#"
        INSERT INTO sale_items (
            id, remote_id, sale_id, product_id, sku_snapshot, name_snapshot,
            quantity, unit_price_cents, line_total_cents, sync_status, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    "#;
    const UPSERT_CLAUSE: &'static str = r#"
        ON CONFLICT(id) DO UPDATE SET
            remote_id = excluded.remote_id,
            sale_id = excluded.sale_id,
            product_id = excluded.product_id,
            sku_snapshot = excluded.sku_snapshot,
            name_snapshot = excluded.name_snapshot,
            quantity = excluded.quantity,
            unit_price_cents = excluded.unit_price_cents,
            line_total_cents = excluded.line_total_cents,
            sync_status = excluded.sync_status,
            updated_at = excluded.updated_at
    "#;

    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id.clone())
            .bind(self.remote_id.clone())
            .bind(self.sale_id.clone())
            .bind(self.product_id.clone())
            .bind(self.sku_snapshot.clone())
            .bind(self.name_snapshot.clone())
            .bind(self.quantity)
            .bind(self.unit_price_cents)
            .bind(self.line_total_cents)
            .bind(self.sync_status)
            .bind(self.updated_at)
    }
}

impl StoredEntity for StockMovement {
    const COLUMNS: &'static str = "id, remote_id, product_id, quantity_delta, reason, reference_id, \
         note, sync_status, created_at, updated_at";
    const INSERT_SQL: &'static str = r#"
        INSERT INTO stock_movements (
            id, remote_id, product_id, quantity_delta, reason, reference_id,
            note, sync_status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    "#;
    const UPSERT_CLAUSE: &'static str = r#"
        ON CONFLICT(id) DO UPDATE SET
            remote_id = excluded.remote_id,
            product_id = excluded.product_id,
            quantity_delta = excluded.quantity_delta,
            reason = excluded.reason,
            reference_id = excluded.reference_id,
            note = excluded.note,
            sync_status = excluded.sync_status,
            updated_at = excluded.updated_at
    "#;

    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id.clone())
            .bind(self.remote_id.clone())
            .bind(self.product_id.clone())
            .bind(self.quantity_delta)
            .bind(self.reason)
            .bind(self.reference_id.clone())
            .bind(self.note.clone())
            .bind(self.sync_status)
            .bind(self.created_at)
            .bind(self.updated_at)
    }
}

impl StoredEntity for CashierOrder {
    const COLUMNS: &'static str = "id, remote_id, order_number, cashier_id, status, total_cents, \
         notes, sync_status, created_at, updated_at";
    const INSERT_SQL: &'static str = r#"
        INSERT INTO cashier_orders (
            id, remote_id, order_number, cashier_id, status, total_cents,
            notes, sync_status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    "#;
    const UPSERT_CLAUSE: &'static str = r#"
        ON CONFLICT(id) DO UPDATE SET
            remote_id = excluded.remote_id,
            order_number = excluded.order_number,
            cashier_id = excluded.cashier_id,
            status = excluded.status,
            total_cents = excluded.total_cents,
            notes = excluded.notes,
            sync_status = excluded.sync_status,
            updated_at = excluded.updated_at
    "#;

    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id.clone())
            .bind(self.remote_id.clone())
            .bind(self.order_number.clone())
            .bind(self.cashier_id.clone())
            .bind(self.status)
            .bind(self.total_cents)
            .bind(self.notes.clone())
            .bind(self.sync_status)
            .bind(self.created_at)
            .bind(self.updated_at)
    }
}

/// Runs `$body` with `$ty` aliased to the entity type stored in `$table`.
#[macro_export]
macro_rules! with_entity_type {
    ($table:expr, $ty:ident => $body:expr) => {
        match $table {
            ::tillsync_core::EntityTable::Products => {
                type $ty = ::tillsync_core::Product;
                $body
            }
            ::tillsync_core::EntityTable::Sales => {
                type $ty = ::tillsync_core::Sale;
                $body
            }
            ::tillsync_core::EntityTable::SaleItems => {
                type $ty = ::tillsync_core::SaleItem;
                $body
            }
            ::tillsync_core::EntityTable::StockMovements => {
                type $ty = ::tillsync_core::StockMovement;
                $body
            }
            ::tillsync_core::EntityTable::CashierOrders => {
                type $ty = ::tillsync_core::CashierOrder;
                $body
            }
        }
    };
}

/// Runs `$body` with `$rec` bound to the typed record inside `$snapshot`.
#[macro_export]
macro_rules! with_snapshot_record {
    ($snapshot:expr, $rec:ident => $body:expr) => {
        match $snapshot {
            ::tillsync_core::EntitySnapshot::Products($rec) => $body,
            ::tillsync_core::EntitySnapshot::Sales($rec) => $body,
            ::tillsync_core::EntitySnapshot::SaleItems($rec) => $body,
            ::tillsync_core::EntitySnapshot::StockMovements($rec) => $body,
            ::tillsync_core::EntitySnapshot::CashierOrders($rec) => $body,
        }
    };
}

// =============================================================================
// Row-level Functions
// =============================================================================

/// Optional predicates for [`Database::query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFilter {
    pub sync_status: Option<SyncStatus>,
    pub remote_id: Option<String>,
    /// `Some(true)` keeps mirrored rows only, `Some(false)` unsynced ones.
    pub has_remote_id: Option<bool>,
    pub updated_since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl EntityFilter {
    pub fn with_status(status: SyncStatus) -> Self {
        EntityFilter {
            sync_status: Some(status),
            ..Default::default()
        }
    }
}

/// Fetches one row by local id.
pub async fn fetch<E: StoredEntity>(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<E>> {
    let sql = format!("SELECT {} FROM {} WHERE id = ?1", E::COLUMNS, E::TABLE.as_str());
    let row = sqlx::query_as::<_, E>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

/// Fetches one row by remote identifier.
pub async fn fetch_by_remote_id<E: StoredEntity>(
    conn: &mut SqliteConnection,
    remote_id: &str,
) -> DbResult<Option<E>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE remote_id = ?1",
        E::COLUMNS,
        E::TABLE.as_str()
    );
    let row = sqlx::query_as::<_, E>(&sql)
        .bind(remote_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

/// Inserts a new row. Fails on an existing id.
pub async fn insert_row<E: StoredEntity>(conn: &mut SqliteConnection, record: &E) -> DbResult<()> {
    record
        .bind_columns(sqlx::query(E::INSERT_SQL))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Inserts or replaces a row keyed by local id. Does not touch the queue.
pub async fn upsert_row<E: StoredEntity>(conn: &mut SqliteConnection, record: &E) -> DbResult<()> {
    let sql = format!("{} {}", E::INSERT_SQL, E::UPSERT_CLAUSE);
    record
        .bind_columns(sqlx::query(&sql))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Deletes a row by local id, returning whether it existed.
pub async fn delete_row(conn: &mut SqliteConnection, table: EntityTable, id: &str) -> DbResult<bool> {
    let sql = format!("DELETE FROM {} WHERE id = ?1", table.as_str());
    let result = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

/// Remote identifier of a local row, if it has one.
pub async fn remote_id_of(
    conn: &mut SqliteConnection,
    table: EntityTable,
    local_id: &str,
) -> DbResult<Option<String>> {
    let sql = format!("SELECT remote_id FROM {} WHERE id = ?1", table.as_str());
    let remote: Option<Option<String>> = sqlx::query_scalar(&sql)
        .bind(local_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(remote.flatten())
}

/// Local id of the row mirroring `remote_id`.
pub async fn local_id_of(
    conn: &mut SqliteConnection,
    table: EntityTable,
    remote_id: &str,
) -> DbResult<Option<String>> {
    let sql = format!("SELECT id FROM {} WHERE remote_id = ?1", table.as_str());
    let local = sqlx::query_scalar(&sql)
        .bind(remote_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(local)
}

/// Records the authority's acknowledgement of a row: sets its remote id (if
/// given) and its sync status, without touching business fields or the queue.
pub async fn set_sync_state(
    conn: &mut SqliteConnection,
    table: EntityTable,
    id: &str,
    remote_id: Option<&str>,
    status: SyncStatus,
) -> DbResult<()> {
    let sql = format!(
        "UPDATE {} SET remote_id = COALESCE(?1, remote_id), sync_status = ?2 WHERE id = ?3",
        table.as_str()
    );
    sqlx::query(&sql)
        .bind(remote_id)
        .bind(status)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Runs a filtered select.
pub async fn query_rows<E: StoredEntity>(
    conn: &mut SqliteConnection,
    filter: &EntityFilter,
) -> DbResult<Vec<E>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {} FROM {} WHERE 1 = 1",
        E::COLUMNS,
        E::TABLE.as_str()
    ));

    if let Some(status) = filter.sync_status {
        qb.push(" AND sync_status = ").push_bind(status);
    }
    if let Some(remote_id) = &filter.remote_id {
        qb.push(" AND remote_id = ").push_bind(remote_id.clone());
    }
    match filter.has_remote_id {
        Some(true) => {
            qb.push(" AND remote_id IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND remote_id IS NULL");
        }
        None => {}
    }
    if let Some(since) = filter.updated_since {
        qb.push(" AND updated_at >= ").push_bind(since);
    }

    qb.push(" ORDER BY rowid");

    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit);
    }

    let rows = qb.build_query_as::<E>().fetch_all(&mut *conn).await?;
    Ok(rows)
}

// =============================================================================
// Local Store Contract
// =============================================================================

impl Database {
    /// Inserts a locally-originated record and enqueues its create.
    ///
    /// The record is stamped `pending` with a fresh `updated_at`. Any remote
    /// identifier on the input is cleared: rows from the authority come in
    /// through the pull phase instead.
    ///
    /// ## Returns
    /// The local id of the new row.
    pub async fn insert<E: StoredEntity>(&self, mut record: E) -> DbResult<String> {
        if record.id().is_empty() {
            record.set_id(new_local_id());
        }
        record.set_remote_id(None);
        record.set_sync_status(SyncStatus::Pending);
        record.set_updated_at(Utc::now());

        let mut tx = self.pool().begin().await?;
        insert_row(&mut *tx, &record).await?;
        let id = record.id().to_string();
        enqueue_change_on(
            &mut *tx,
            QueueMutation::Create {
                snapshot: record.into_snapshot(),
            },
        )
        .await?;
        tx.commit().await?;

        debug!(entity_table = %E::TABLE, id = %id, "Inserted record");
        Ok(id)
    }

    /// Applies `patch` to a row and enqueues the change.
    ///
    /// Identity fields are restored after the patch runs, so a patch cannot
    /// re-key a row or forge a remote identifier. A row flagged `conflict`
    /// keeps the flag until the resolver settles it.
    pub async fn update<E, F>(&self, id: &str, patch: F) -> DbResult<E>
    where
        E: StoredEntity,
        F: FnOnce(&mut E) + Send,
    {
        let mut tx = self.pool().begin().await?;
        let current: E = fetch(&mut *tx, id)
            .await?
            .ok_or_else(|| DbError::not_found(E::TABLE.as_str(), id))?;

        let mut next = current.clone();
        patch(&mut next);
        next.set_id(current.id().to_string());
        next.set_remote_id(current.remote_id().map(str::to_string));
        next.set_sync_status(match current.sync_status() {
            SyncStatus::Conflict => SyncStatus::Conflict,
            _ => SyncStatus::Pending,
        });
        next.set_updated_at(Utc::now());

        upsert_row(&mut *tx, &next).await?;
        enqueue_change_on(
            &mut *tx,
            QueueMutation::Update {
                snapshot: next.clone().into_snapshot(),
            },
        )
        .await?;
        tx.commit().await?;

        debug!(entity_table = %E::TABLE, id = %id, "Updated record");
        Ok(next)
    }

    /// Deletes a row.
    ///
    /// A row the authority already knows gets a delete queued. A row that was
    /// never pushed just has its pending items cancelled.
    ///
    /// ## Returns
    /// `true` if a delete will be pushed.
    pub async fn delete<E: StoredEntity>(&self, id: &str) -> DbResult<bool> {
        let mut tx = self.pool().begin().await?;
        let current: E = fetch(&mut *tx, id)
            .await?
            .ok_or_else(|| DbError::not_found(E::TABLE.as_str(), id))?;

        delete_row(&mut *tx, E::TABLE, id).await?;

        let will_sync = match current.remote_id() {
            Some(remote_id) => {
                enqueue_change_on(
                    &mut *tx,
                    QueueMutation::Delete {
                        entity_table: E::TABLE,
                        local_id: id.to_string(),
                        remote_id: remote_id.to_string(),
                    },
                )
                .await?;
                true
            }
            None => {
                let cancelled = drop_pending_for_entity_on(&mut *tx, E::TABLE, id).await?;
                debug!(entity_table = %E::TABLE, id = %id, cancelled, "Cancelled unsynced record");
                false
            }
        };
        tx.commit().await?;

        Ok(will_sync)
    }

    /// Gets a row by local id.
    pub async fn get<E: StoredEntity>(&self, id: &str) -> DbResult<Option<E>> {
        let mut conn = self.pool().acquire().await?;
        fetch(&mut *conn, id).await
    }

    /// Gets a row by remote identifier.
    pub async fn find_by_remote_id<E: StoredEntity>(&self, remote_id: &str) -> DbResult<Option<E>> {
        let mut conn = self.pool().acquire().await?;
        fetch_by_remote_id(&mut *conn, remote_id).await
    }

    /// Selects rows matching `filter`.
    pub async fn query<E: StoredEntity>(&self, filter: &EntityFilter) -> DbResult<Vec<E>> {
        let mut conn = self.pool().acquire().await?;
        query_rows(&mut *conn, filter).await
    }

    // -------------------------------------------------------------------------
    // Table-dispatched variants (for callers holding an EntitySnapshot)
    // -------------------------------------------------------------------------

    /// [`Database::insert`] for a tagged snapshot.
    pub async fn insert_snapshot(&self, snapshot: EntitySnapshot) -> DbResult<String> {
        with_snapshot_record!(snapshot, record => self.insert(record).await)
    }

    /// Replaces the business fields of an existing row with those of
    /// `snapshot` (matched by the snapshot's local id).
    pub async fn update_snapshot(&self, snapshot: EntitySnapshot) -> DbResult<EntitySnapshot> {
        with_snapshot_record!(snapshot, record => {
            self.replace(record).await.map(SyncRecord::into_snapshot)
        })
    }

    async fn replace<E: StoredEntity>(&self, record: E) -> DbResult<E> {
        let id = record.id().to_string();
        self.update(&id, move |row: &mut E| *row = record).await
    }

    /// [`Database::delete`] by table.
    pub async fn delete_in(&self, table: EntityTable, id: &str) -> DbResult<bool> {
        with_entity_type!(table, E => self.delete::<E>(id).await)
    }

    /// [`Database::query`] by table.
    pub async fn query_snapshots(
        &self,
        table: EntityTable,
        filter: &EntityFilter,
    ) -> DbResult<Vec<EntitySnapshot>> {
        with_entity_type!(table, E => {
            let rows = self.query::<E>(filter).await?;
            Ok(rows.into_iter().map(SyncRecord::into_snapshot).collect())
        })
    }

    /// [`Database::get`] by table.
    pub async fn get_snapshot(&self, table: EntityTable, id: &str) -> DbResult<Option<EntitySnapshot>> {
        with_entity_type!(table, E => {
            let row = self.get::<E>(id).await?;
            Ok(row.map(SyncRecord::into_snapshot))
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use tillsync_core::{Operation, QueueStatus};

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_enqueues_create_in_same_transaction() {
        let db = db().await;
        let mut product = Product::new("COKE-330", "Coca-Cola 330ml", 1599, 10);
        product.remote_id = Some("should-be-cleared".into());

        let id = db.insert(product).await.unwrap();

        let stored: Product = db.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert!(stored.remote_id.is_none());

        let items = db.queue().items_for_entity(EntityTable::Products, &id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, Operation::Create);
        assert_eq!(items[0].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_update_of_unpushed_row_refreshes_pending_create() {
        let db = db().await;
        let id = db.insert(Product::new("SKU-1", "Thing", 100, 5)).await.unwrap();

        db.update::<Product, _>(&id, |p| p.price_cents = 250).await.unwrap();

        let items = db.queue().items_for_entity(EntityTable::Products, &id).await.unwrap();
        assert_eq!(items.len(), 1, "update coalesces into the pending create");
        assert_eq!(items[0].operation, Operation::Create);
        let snapshot = items[0].payload.snapshot().unwrap().clone();
        let queued = Product::from_snapshot(snapshot).unwrap();
        assert_eq!(queued.price_cents, 250);
    }

    #[tokio::test]
    async fn test_update_cannot_change_identity() {
        let db = db().await;
        let id = db.insert(Product::new("SKU-1", "Thing", 100, 5)).await.unwrap();

        let updated = db
            .update::<Product, _>(&id, |p| {
                p.id = "hijack".into();
                p.remote_id = Some("forged".into());
                p.name = "Renamed".into();
            })
            .await
            .unwrap();

        assert_eq!(updated.id, id);
        assert!(updated.remote_id.is_none());
        assert_eq!(updated.name, "Renamed");
    }

    #[tokio::test]
    async fn test_update_keeps_open_conflict_flag() {
        let db = db().await;
        let mut product = Product::new("SKU-1", "Thing", 100, 5);
        product.remote_id = Some("rp-3".into());
        product.sync_status = SyncStatus::Conflict;
        {
            let mut conn = db.pool().acquire().await.unwrap();
            insert_row(&mut *conn, &product).await.unwrap();
        }

        let updated = db
            .update::<Product, _>(&product.id, |p| p.name = "Renamed".into())
            .await
            .unwrap();
        assert_eq!(updated.sync_status, SyncStatus::Conflict);

        let stored: Product = db.get(&product.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Conflict);
        assert_eq!(stored.name, "Renamed");

        let items = db
            .queue()
            .items_for_entity(EntityTable::Products, &product.id)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, Operation::Update);
    }

    #[tokio::test]
    async fn test_delete_unpushed_row_cancels_queue() {
        let db = db().await;
        let id = db.insert(Product::new("SKU-1", "Thing", 100, 5)).await.unwrap();

        let will_sync = db.delete::<Product>(&id).await.unwrap();
        assert!(!will_sync);
        assert!(db.get::<Product>(&id).await.unwrap().is_none());
        assert!(db
            .queue()
            .items_for_entity(EntityTable::Products, &id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_mirrored_row_enqueues_delete() {
        let db = db().await;
        let mut product = Product::new("SKU-1", "Thing", 100, 5);
        product.remote_id = Some("rp-9".into());
        product.sync_status = SyncStatus::Synced;
        {
            let mut conn = db.pool().acquire().await.unwrap();
            insert_row(&mut *conn, &product).await.unwrap();
        }

        let will_sync = db.delete_in(EntityTable::Products, &product.id).await.unwrap();
        assert!(will_sync);

        let items = db
            .queue()
            .items_for_entity(EntityTable::Products, &product.id)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, Operation::Delete);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let db = db().await;
        db.insert(Product::new("A", "A", 100, 1)).await.unwrap();
        let mut mirrored = Product::new("B", "B", 100, 1);
        mirrored.remote_id = Some("rb".into());
        mirrored.sync_status = SyncStatus::Synced;
        {
            let mut conn = db.pool().acquire().await.unwrap();
            insert_row(&mut *conn, &mirrored).await.unwrap();
        }

        let pending: Vec<Product> = db
            .query(&EntityFilter::with_status(SyncStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sku, "A");

        let remote = db
            .query_snapshots(
                EntityTable::Products,
                &EntityFilter {
                    has_remote_id: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].remote_id(), Some("rb"));

        assert!(db.find_by_remote_id::<Product>("rb").await.unwrap().is_some());
    }
}
