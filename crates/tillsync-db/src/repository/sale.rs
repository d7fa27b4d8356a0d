//! # Sale Repository
//!
//! Sale creation (the canonical multi-table transaction) and sale reads.
//!
//! ## Sale Creation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  db.create_sale(NewSale)                                                │
//! │       │                                                                 │
//! │       ▼  validate_new_sale (no I/O)                                     │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. Read each product, freeze sku/name/price into the lines    │   │
//! │  │  2. Totals, tendered check, change                             │   │
//! │  │  3. INSERT sale            + enqueue create                     │   │
//! │  │  4. per line:                                                   │   │
//! │  │       INSERT sale_item     + enqueue create                     │   │
//! │  │       UPDATE products SET stock_quantity -= qty                 │   │
//! │  │              WHERE stock_quantity >= qty   ← guard              │   │
//! │  │       INSERT stock_movement(reason = sale) + enqueue create     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ├── guard matched 0 rows → InsufficientStock → ROLLBACK          │
//! │       ▼                                                                 │
//! │  COMMIT                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A product the authority already knows is not re-queued for the stock
//! change; the movement carries the delta and the next pull brings the
//! authority's count back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use tillsync_core::validation::{validate_new_sale, validate_tendered};
use tillsync_core::{
    new_local_id, CoreError, Money, MovementReason, NewSale, PaymentMethod, Product,
    QueueMutation, Sale, SaleItem, SaleStatus, StockMovement, SyncRecord, SyncStatus,
};

use crate::error::{DbError, DbResult};
use crate::pool::Database;
use crate::repository::queue::enqueue_change_on;
use crate::store::{fetch, insert_row, EntityFilter, StoredEntity};

/// Everything one sale wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedSale {
    pub sale: Sale,
    pub items: Vec<SaleItem>,
    pub movements: Vec<StockMovement>,
}

impl Database {
    /// Records a sale atomically.
    ///
    /// ## Arguments
    /// * `new_sale` - Cashier, lines and payment as entered at the till
    ///
    /// ## Returns
    /// * `Ok(RecordedSale)` - Sale, items and stock movements, all queued
    /// * `Err(DbError::InsufficientStock)` - A line exceeded stock; nothing was written
    /// * `Err(DbError::Domain)` - Validation failed or a product is unknown
    pub async fn create_sale(&self, new_sale: NewSale) -> DbResult<RecordedSale> {
        validate_new_sale(&new_sale).map_err(CoreError::from)?;

        let recorded = self
            .transaction(move |conn: &mut SqliteConnection| {
                Box::pin(async move { record_sale_on(conn, &new_sale).await })
            })
            .await?;

        info!(
            sale = %recorded.sale.id,
            receipt_number = %recorded.sale.receipt_number,
            total = %recorded.sale.total(),
            lines = recorded.items.len(),
            "Sale recorded"
        );
        Ok(recorded)
    }

    /// Returns the sale repository.
    pub fn sales(&self) -> SaleRepository {
        SaleRepository::new(self.pool().clone())
    }
}

/// Body of [`Database::create_sale`], run on the transaction's connection.
async fn record_sale_on(conn: &mut SqliteConnection, new_sale: &NewSale) -> DbResult<RecordedSale> {
    let now = Utc::now();
    let sale_id = new_local_id();

    // Freeze product details first so totals are known before any write.
    let mut items = Vec::with_capacity(new_sale.lines.len());
    for line in &new_sale.lines {
        let product: Product = fetch(&mut *conn, &line.product_id)
            .await?
            .ok_or_else(|| CoreError::ProductNotFound(line.product_id.clone()))?;

        let line_total = product
            .price()
            .checked_times(line.quantity)
            .ok_or_else(|| CoreError::InvalidPaymentAmount {
                reason: format!("line total overflows for {}", product.sku),
            })?;

        items.push(SaleItem {
            id: new_local_id(),
            remote_id: None,
            sale_id: sale_id.clone(),
            product_id: product.id.clone(),
            sku_snapshot: product.sku.clone(),
            name_snapshot: product.name.clone(),
            quantity: line.quantity,
            unit_price_cents: product.price_cents,
            line_total_cents: line_total.cents(),
            sync_status: SyncStatus::Pending,
            updated_at: now,
        });
    }

    let subtotal: Money = items.iter().map(|i| Money::from_cents(i.line_total_cents)).sum();
    let total = subtotal.saturating_sub_floor_zero(Money::from_cents(new_sale.discount_cents));

    let (tendered, change) = match new_sale.payment_method {
        PaymentMethod::Cash => {
            let tendered = new_sale.amount_tendered_cents.unwrap_or_default();
            validate_tendered(total.cents(), tendered).map_err(CoreError::from)?;
            (tendered, tendered - total.cents())
        }
        PaymentMethod::Card => (total.cents(), 0),
    };

    let sale = Sale {
        id: sale_id.clone(),
        remote_id: None,
        receipt_number: next_receipt_number(&mut *conn, now).await?,
        cashier_id: new_sale.cashier_id.clone(),
        subtotal_cents: subtotal.cents(),
        discount_cents: new_sale.discount_cents,
        total_cents: total.cents(),
        payment_method: new_sale.payment_method,
        amount_tendered_cents: tendered,
        change_cents: change,
        status: SaleStatus::Completed,
        sync_status: SyncStatus::Pending,
        created_at: now,
        updated_at: now,
    };

    insert_queued(&mut *conn, &sale).await?;

    let mut movements = Vec::with_capacity(items.len());
    for item in &items {
        insert_queued(&mut *conn, item).await?;
        decrement_stock(&mut *conn, &item.product_id, item.quantity, now).await?;

        let mut movement = StockMovement::new(&item.product_id, -item.quantity, MovementReason::Sale);
        movement.reference_id = Some(sale_id.clone());
        movement.created_at = now;
        movement.updated_at = now;
        insert_queued(&mut *conn, &movement).await?;
        movements.push(movement);
    }

    debug!(sale = %sale.id, items = items.len(), "Sale rows written");
    Ok(RecordedSale {
        sale,
        items,
        movements,
    })
}

async fn insert_queued<E: StoredEntity>(conn: &mut SqliteConnection, record: &E) -> DbResult<()> {
    insert_row(&mut *conn, record).await?;
    enqueue_change_on(
        &mut *conn,
        QueueMutation::Create {
            snapshot: record.clone().into_snapshot(),
        },
    )
    .await?;
    Ok(())
}

/// Guarded stock decrement.
///
/// ## Returns
/// * `Err(DbError::InsufficientStock)` - The product holds fewer than `quantity`
async fn decrement_stock(
    conn: &mut SqliteConnection,
    product_id: &str,
    quantity: i64,
    now: DateTime<Utc>,
) -> DbResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE products
        SET stock_quantity = stock_quantity - ?1, updated_at = ?2
        WHERE id = ?3 AND stock_quantity >= ?1
        "#,
    )
    .bind(quantity)
    .bind(now)
    .bind(product_id)
    .execute(&mut *conn)
    .await?;

    let product: Product = fetch(&mut *conn, product_id)
        .await?
        .ok_or_else(|| CoreError::ProductNotFound(product_id.to_string()))?;

    if result.rows_affected() == 0 {
        return Err(DbError::InsufficientStock {
            sku: product.sku,
            available: product.stock_quantity,
            requested: quantity,
        });
    }

    // A product never pushed must carry its current count in its queued create.
    if product.remote_id.is_none() {
        enqueue_change_on(
            &mut *conn,
            QueueMutation::Update {
                snapshot: product.into_snapshot(),
            },
        )
        .await?;
    }

    Ok(())
}

/// Generates a receipt number in format: YYYYMMDD-NNNN
///
/// NNNN comes from the day's counter in `receipt_sequence`, which only ever
/// moves forward.
async fn next_receipt_number(conn: &mut SqliteConnection, now: DateTime<Utc>) -> DbResult<String> {
    let date_part = now.format("%Y%m%d").to_string();

    let number: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO receipt_sequence (day, last_no) VALUES (?1, 1)
        ON CONFLICT(day) DO UPDATE SET last_no = last_no + 1
        RETURNING last_no
        "#,
    )
    .bind(&date_part)
    .fetch_one(&mut *conn)
    .await?;

    Ok(format!("{}-{:04}", date_part, number))
}

// =============================================================================
// Reads
// =============================================================================

/// Repository for sale reads.
#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    /// Gets a sale by local id.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Sale>> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut *conn, id).await
    }

    /// Gets all items for a sale.
    pub async fn get_items(&self, sale_id: &str) -> DbResult<Vec<SaleItem>> {
        let sql = format!(
            "SELECT {} FROM sale_items WHERE sale_id = ?1 ORDER BY rowid",
            SaleItem::COLUMNS
        );
        let items = sqlx::query_as::<_, SaleItem>(&sql)
            .bind(sale_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    /// Sales that have not reached the authority yet.
    pub async fn unsynced(&self) -> DbResult<Vec<Sale>> {
        let mut conn = self.pool.acquire().await?;
        crate::store::query_rows(
            &mut *conn,
            &EntityFilter {
                has_remote_id: Some(false),
                ..Default::default()
            },
        )
        .await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
