//! # Domain Types
//!
//! Business entities mirrored between the device and the sync authority.
//!
//! ## Sync Identity
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   Identity of a synced record                           │
//! │                                                                         │
//! │  id          UUID v4 assigned on the device (never changes)            │
//! │  remote_id   assigned by the authority once it accepts the record       │
//! │              None  → locally originated, must be in the Change Queue    │
//! │  sync_status pending | synced | conflict | failed                       │
//! │  updated_at  last-modified timestamp (timestamp_wins compares this)     │
//! │                                                                         │
//! │  ┌──────────┐  ┌──────┐  ┌──────────┐  ┌──────────────┐  ┌───────────┐ │
//! │  │ Product  │  │ Sale │◄─┤ SaleItem │  │StockMovement │  │CashierOrder│ │
//! │  └────▲─────┘  └──────┘  └────┬─────┘  └──────┬───────┘  └───────────┘ │
//! │       └────────────────────────┴───────────────┘                        │
//! │                  product_id / sale_id foreign keys                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Foreign keys always hold *local* ids on the device. The sync crate rewrites
//! them to remote ids on the way out and back again on the way in.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;

// =============================================================================
// Entity Table
// =============================================================================

/// The business tables that take part in synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum EntityTable {
    Products,
    Sales,
    SaleItems,
    StockMovements,
    CashierOrders,
}

impl EntityTable {
    /// All tables in dependency order: parents before the rows that
    /// reference them. Pull applies collections in this order.
    pub const ALL: [EntityTable; 5] = [
        EntityTable::Products,
        EntityTable::CashierOrders,
        EntityTable::Sales,
        EntityTable::SaleItems,
        EntityTable::StockMovements,
    ];

    /// SQL table name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityTable::Products => "products",
            EntityTable::Sales => "sales",
            EntityTable::SaleItems => "sale_items",
            EntityTable::StockMovements => "stock_movements",
            EntityTable::CashierOrders => "cashier_orders",
        }
    }

    /// Path segment of the authority's collection endpoint.
    pub const fn collection(&self) -> &'static str {
        match self {
            EntityTable::Products => "products",
            EntityTable::Sales => "sales",
            EntityTable::SaleItems => "sale-items",
            EntityTable::StockMovements => "stock-movements",
            EntityTable::CashierOrders => "cashier-orders",
        }
    }
}

impl fmt::Display for EntityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityTable {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "products" => Ok(EntityTable::Products),
            "sales" => Ok(EntityTable::Sales),
            "sale_items" => Ok(EntityTable::SaleItems),
            "stock_movements" => Ok(EntityTable::StockMovements),
            "cashier_orders" => Ok(EntityTable::CashierOrders),
            other => Err(CoreError::UnknownEntityTable(other.to_string())),
        }
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Per-row synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SyncStatus {
    /// Local changes not yet confirmed by the authority.
    #[default]
    Pending,
    /// Local row matches what the authority last acknowledged.
    Synced,
    /// Divergence detected, waiting for the resolver.
    Conflict,
    /// The outbound mutation hit terminal failure (manual review).
    Failed,
}

// =============================================================================
// Product
// =============================================================================

/// A catalog product with its on-hand stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Product {
    pub id: String,
    pub remote_id: Option<String>,
    pub sku: String,
    pub name: String,
    /// Unit price in cents.
    pub price_cents: i64,
    /// Units on hand. Never negative after a sale.
    pub stock_quantity: i64,
    pub is_active: bool,
    pub sync_status: SyncStatus,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Builds a new locally-originated product.
    pub fn new(sku: impl Into<String>, name: impl Into<String>, price_cents: i64, stock_quantity: i64) -> Self {
        Product {
            id: new_local_id(),
            remote_id: None,
            sku: sku.into(),
            name: name.into(),
            price_cents,
            stock_quantity,
            is_active: true,
            sync_status: SyncStatus::Pending,
            updated_at: Utc::now(),
        }
    }

    #[inline]
    pub fn price(&self) -> Money {
        Money::from_cents(self.price_cents)
    }
}

// =============================================================================
// Sale
// =============================================================================

/// How a sale was paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum PaymentMethod {
    Cash,
    Card,
}

/// Lifecycle of a recorded sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SaleStatus {
    #[default]
    Completed,
    Voided,
}

/// A completed in-store transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Sale {
    pub id: String,
    pub remote_id: Option<String>,
    pub receipt_number: String,
    pub cashier_id: String,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub payment_method: PaymentMethod,
    pub amount_tendered_cents: i64,
    pub change_cents: i64,
    pub status: SaleStatus,
    pub sync_status: SyncStatus,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Sale {
    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }
}

/// A line of a sale. Product fields are frozen at the time of sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct SaleItem {
    pub id: String,
    pub remote_id: Option<String>,
    pub sale_id: String,
    pub product_id: String,
    pub sku_snapshot: String,
    pub name_snapshot: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub line_total_cents: i64,
    pub sync_status: SyncStatus,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Stock Movement
// =============================================================================

/// Why stock changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum MovementReason {
    Sale,
    Restock,
    Adjustment,
    Return,
}

/// A signed inventory delta for one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct StockMovement {
    pub id: String,
    pub remote_id: Option<String>,
    pub product_id: String,
    pub quantity_delta: i64,
    pub reason: MovementReason,
    /// Sale id (or other document) that caused the movement.
    pub reference_id: Option<String>,
    pub note: Option<String>,
    pub sync_status: SyncStatus,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn new(product_id: impl Into<String>, quantity_delta: i64, reason: MovementReason) -> Self {
        let now = Utc::now();
        StockMovement {
            id: new_local_id(),
            remote_id: None,
            product_id: product_id.into(),
            quantity_delta,
            reason,
            reference_id: None,
            note: None,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Cashier Order
// =============================================================================

/// Approval state of a cashier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum OrderStatus {
    #[default]
    Requested,
    Approved,
    Rejected,
    Fulfilled,
}

/// An operational order raised at the till (e.g. a supply request) that the
/// back office approves or rejects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct CashierOrder {
    pub id: String,
    pub remote_id: Option<String>,
    pub order_number: String,
    pub cashier_id: String,
    pub status: OrderStatus,
    pub total_cents: i64,
    pub notes: Option<String>,
    pub sync_status: SyncStatus,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl CashierOrder {
    pub fn new(order_number: impl Into<String>, cashier_id: impl Into<String>, total_cents: i64) -> Self {
        let now = Utc::now();
        CashierOrder {
            id: new_local_id(),
            remote_id: None,
            order_number: order_number.into(),
            cashier_id: cashier_id.into(),
            status: OrderStatus::Requested,
            total_cents,
            notes: None,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Entity Snapshot
// =============================================================================

/// A full copy of one entity, tagged by its table.
///
/// This is what queue payloads, remote shadows and conflict records store.
/// Serialized as `{"entity_table": "products", "record": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "entity_table", content = "record", rename_all = "snake_case")]
#[ts(export)]
pub enum EntitySnapshot {
    Products(Product),
    Sales(Sale),
    SaleItems(SaleItem),
    StockMovements(StockMovement),
    CashierOrders(CashierOrder),
}

impl EntitySnapshot {
    pub fn table(&self) -> EntityTable {
        match self {
            EntitySnapshot::Products(_) => EntityTable::Products,
            EntitySnapshot::Sales(_) => EntityTable::Sales,
            EntitySnapshot::SaleItems(_) => EntityTable::SaleItems,
            EntitySnapshot::StockMovements(_) => EntityTable::StockMovements,
            EntitySnapshot::CashierOrders(_) => EntityTable::CashierOrders,
        }
    }

    pub fn local_id(&self) -> &str {
        match self {
            EntitySnapshot::Products(r) => r.id(),
            EntitySnapshot::Sales(r) => r.id(),
            EntitySnapshot::SaleItems(r) => r.id(),
            EntitySnapshot::StockMovements(r) => r.id(),
            EntitySnapshot::CashierOrders(r) => r.id(),
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            EntitySnapshot::Products(r) => r.remote_id(),
            EntitySnapshot::Sales(r) => r.remote_id(),
            EntitySnapshot::SaleItems(r) => r.remote_id(),
            EntitySnapshot::StockMovements(r) => r.remote_id(),
            EntitySnapshot::CashierOrders(r) => r.remote_id(),
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            EntitySnapshot::Products(r) => r.updated_at(),
            EntitySnapshot::Sales(r) => r.updated_at(),
            EntitySnapshot::SaleItems(r) => r.updated_at(),
            EntitySnapshot::StockMovements(r) => r.updated_at(),
            EntitySnapshot::CashierOrders(r) => r.updated_at(),
        }
    }
}

// =============================================================================
// SyncRecord Trait
// =============================================================================

/// Behaviour shared by every synchronized entity.
///
/// The identity accessors are mechanical. The interesting parts are
/// [`SyncRecord::diverging_fields`], which decides what counts as a conflict,
/// and [`SyncRecord::merge`], the entity-specific field-level combination.
pub trait SyncRecord: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    const TABLE: EntityTable;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn remote_id(&self) -> Option<&str>;
    fn set_remote_id(&mut self, remote_id: Option<String>);
    fn sync_status(&self) -> SyncStatus;
    fn set_sync_status(&mut self, status: SyncStatus);
    fn updated_at(&self) -> DateTime<Utc>;
    fn set_updated_at(&mut self, at: DateTime<Utc>);

    /// Names of business-significant fields that differ between `self` and
    /// `other`. Identity and bookkeeping fields are never compared.
    fn diverging_fields(&self, other: &Self) -> Vec<&'static str>;

    /// Field-level combination of a local and a remote copy. The result keeps
    /// the local row id and the remote identifier.
    fn merge(local: &Self, remote: &Self) -> Self;

    /// `(referenced table, local id)` for each foreign key column.
    fn foreign_keys(&self) -> Vec<(EntityTable, &str)> {
        Vec::new()
    }

    /// Mutable access to foreign key columns, used to rewrite local ids to
    /// remote ids and back.
    fn foreign_keys_mut(&mut self) -> Vec<(EntityTable, &mut String)> {
        Vec::new()
    }

    fn into_snapshot(self) -> EntitySnapshot;
    fn from_snapshot(snapshot: EntitySnapshot) -> CoreResult<Self>;
}

/// Implements the identity accessors of [`SyncRecord`] for a struct with the
/// standard `id`, `remote_id`, `sync_status`, `updated_at` fields.
macro_rules! sync_identity {
    ($variant:ident) => {
        const TABLE: EntityTable = EntityTable::$variant;

        fn id(&self) -> &str {
            &self.id
        }
        fn set_id(&mut self, id: String) {
            self.id = id;
        }
        fn remote_id(&self) -> Option<&str> {
            self.remote_id.as_deref()
        }
        fn set_remote_id(&mut self, remote_id: Option<String>) {
            self.remote_id = remote_id;
        }
        fn sync_status(&self) -> SyncStatus {
            self.sync_status
        }
        fn set_sync_status(&mut self, status: SyncStatus) {
            self.sync_status = status;
        }
        fn updated_at(&self) -> DateTime<Utc> {
            self.updated_at
        }
        fn set_updated_at(&mut self, at: DateTime<Utc>) {
            self.updated_at = at;
        }
        fn into_snapshot(self) -> EntitySnapshot {
            EntitySnapshot::$variant(self)
        }
        fn from_snapshot(snapshot: EntitySnapshot) -> CoreResult<Self> {
            match snapshot {
                EntitySnapshot::$variant(record) => Ok(record),
                other => Err(CoreError::SnapshotMismatch {
                    expected: EntityTable::$variant,
                    actual: other.table(),
                }),
            }
        }
    };
}

/// Pushes `label` when the two expressions differ.
fn diff<T: PartialEq>(out: &mut Vec<&'static str>, label: &'static str, a: &T, b: &T) {
    if a != b {
        out.push(label);
    }
}

impl SyncRecord for Product {
    sync_identity!(Products);

    fn diverging_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        diff(&mut out, "sku", &self.sku, &other.sku);
        diff(&mut out, "name", &self.name, &other.name);
        diff(&mut out, "price", &self.price_cents, &other.price_cents);
        diff(&mut out, "stock_quantity", &self.stock_quantity, &other.stock_quantity);
        diff(&mut out, "is_active", &self.is_active, &other.is_active);
        out
    }

    /// Inventory merge: the till's stock count, the catalog's everything else.
    fn merge(local: &Self, remote: &Self) -> Self {
        Product {
            id: local.id.clone(),
            remote_id: remote.remote_id.clone().or_else(|| local.remote_id.clone()),
            stock_quantity: local.stock_quantity,
            updated_at: local.updated_at.max(remote.updated_at),
            sync_status: local.sync_status,
            ..remote.clone()
        }
    }
}

impl SyncRecord for Sale {
    sync_identity!(Sales);

    fn diverging_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        diff(&mut out, "subtotal", &self.subtotal_cents, &other.subtotal_cents);
        diff(&mut out, "discount", &self.discount_cents, &other.discount_cents);
        diff(&mut out, "total", &self.total_cents, &other.total_cents);
        diff(&mut out, "payment_method", &self.payment_method, &other.payment_method);
        diff(&mut out, "amount_tendered", &self.amount_tendered_cents, &other.amount_tendered_cents);
        diff(&mut out, "change", &self.change_cents, &other.change_cents);
        diff(&mut out, "status", &self.status, &other.status);
        out
    }

    /// Money fields stay as rung up at the till; a void recorded by the back
    /// office is honoured.
    fn merge(local: &Self, remote: &Self) -> Self {
        let status = if remote.status == SaleStatus::Voided {
            SaleStatus::Voided
        } else {
            local.status
        };
        Sale {
            remote_id: remote.remote_id.clone().or_else(|| local.remote_id.clone()),
            status,
            updated_at: local.updated_at.max(remote.updated_at),
            ..local.clone()
        }
    }
}

impl SyncRecord for SaleItem {
    sync_identity!(SaleItems);

    fn diverging_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        diff(&mut out, "quantity", &self.quantity, &other.quantity);
        diff(&mut out, "unit_price", &self.unit_price_cents, &other.unit_price_cents);
        diff(&mut out, "line_total", &self.line_total_cents, &other.line_total_cents);
        out
    }

    fn merge(local: &Self, remote: &Self) -> Self {
        SaleItem {
            remote_id: remote.remote_id.clone().or_else(|| local.remote_id.clone()),
            updated_at: local.updated_at.max(remote.updated_at),
            ..local.clone()
        }
    }

    fn foreign_keys(&self) -> Vec<(EntityTable, &str)> {
        vec![
            (EntityTable::Sales, self.sale_id.as_str()),
            (EntityTable::Products, self.product_id.as_str()),
        ]
    }

    fn foreign_keys_mut(&mut self) -> Vec<(EntityTable, &mut String)> {
        vec![
            (EntityTable::Sales, &mut self.sale_id),
            (EntityTable::Products, &mut self.product_id),
        ]
    }
}

impl SyncRecord for StockMovement {
    sync_identity!(StockMovements);

    fn diverging_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        diff(&mut out, "quantity_delta", &self.quantity_delta, &other.quantity_delta);
        diff(&mut out, "reason", &self.reason, &other.reason);
        diff(&mut out, "note", &self.note, &other.note);
        out
    }

    /// The counted delta is the till's; an annotation added upstream is kept.
    fn merge(local: &Self, remote: &Self) -> Self {
        StockMovement {
            remote_id: remote.remote_id.clone().or_else(|| local.remote_id.clone()),
            note: remote.note.clone().or_else(|| local.note.clone()),
            updated_at: local.updated_at.max(remote.updated_at),
            ..local.clone()
        }
    }

    fn foreign_keys(&self) -> Vec<(EntityTable, &str)> {
        vec![(EntityTable::Products, self.product_id.as_str())]
    }

    fn foreign_keys_mut(&mut self) -> Vec<(EntityTable, &mut String)> {
        vec![(EntityTable::Products, &mut self.product_id)]
    }
}

impl SyncRecord for CashierOrder {
    sync_identity!(CashierOrders);

    fn diverging_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        diff(&mut out, "status", &self.status, &other.status);
        diff(&mut out, "total", &self.total_cents, &other.total_cents);
        diff(&mut out, "notes", &self.notes, &other.notes);
        out
    }

    /// Approval state and totals come from the back office; the cashier's
    /// notes survive.
    fn merge(local: &Self, remote: &Self) -> Self {
        CashierOrder {
            id: local.id.clone(),
            remote_id: remote.remote_id.clone().or_else(|| local.remote_id.clone()),
            notes: local.notes.clone().or_else(|| remote.notes.clone()),
            sync_status: local.sync_status,
            updated_at: local.updated_at.max(remote.updated_at),
            ..remote.clone()
        }
    }
}

impl From<Product> for EntitySnapshot {
    fn from(r: Product) -> Self {
        EntitySnapshot::Products(r)
    }
}

impl From<Sale> for EntitySnapshot {
    fn from(r: Sale) -> Self {
        EntitySnapshot::Sales(r)
    }
}

impl From<SaleItem> for EntitySnapshot {
    fn from(r: SaleItem) -> Self {
        EntitySnapshot::SaleItems(r)
    }
}

impl From<StockMovement> for EntitySnapshot {
    fn from(r: StockMovement) -> Self {
        EntitySnapshot::StockMovements(r)
    }
}

impl From<CashierOrder> for EntitySnapshot {
    fn from(r: CashierOrder) -> Self {
        EntitySnapshot::CashierOrders(r)
    }
}

// =============================================================================
// New Sale (input)
// =============================================================================

/// One line of a sale being rung up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewSaleLine {
    pub product_id: String,
    pub quantity: i64,
}

/// Input for the sale-creation transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewSale {
    pub cashier_id: String,
    pub lines: Vec<NewSaleLine>,
    pub payment_method: PaymentMethod,
    /// Cash handed over. Defaults to the total for card payments.
    pub amount_tendered_cents: Option<i64>,
    #[serde(default)]
    pub discount_cents: i64,
}

/// Generates a new local identifier.
pub fn new_local_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> Product {
        let mut p = Product::new("COKE-330", "Coca-Cola 330ml", 1000, 12);
        p.remote_id = Some("p-1".into());
        p
    }

    #[test]
    fn test_entity_table_round_trip_names() {
        for table in EntityTable::ALL {
            assert_eq!(table.as_str().parse::<EntityTable>().unwrap(), table);
        }
        assert!("widgets".parse::<EntityTable>().is_err());
    }

    #[test]
    fn test_pull_order_has_parents_first() {
        let pos = |t| EntityTable::ALL.iter().position(|x| *x == t).unwrap();
        assert!(pos(EntityTable::Products) < pos(EntityTable::SaleItems));
        assert!(pos(EntityTable::Sales) < pos(EntityTable::SaleItems));
        assert!(pos(EntityTable::Products) < pos(EntityTable::StockMovements));
    }

    #[test]
    fn test_product_price_divergence_only_reports_price() {
        let local = product();
        let mut remote = local.clone();
        remote.id = "other-local-id".into();
        remote.price_cents = 1200;
        remote.updated_at = local.updated_at + chrono::Duration::seconds(5);

        assert_eq!(local.diverging_fields(&remote), vec!["price"]);
    }

    #[test]
    fn test_product_merge_keeps_local_stock_and_remote_price() {
        let local = product();
        let mut remote = local.clone();
        remote.id = "ignored".into();
        remote.price_cents = 1250;
        remote.name = "Coke 330".into();
        remote.stock_quantity = 40;

        let merged = Product::merge(&local, &remote);
        assert_eq!(merged.id, local.id);
        assert_eq!(merged.stock_quantity, 12);
        assert_eq!(merged.price_cents, 1250);
        assert_eq!(merged.name, "Coke 330");
    }

    #[test]
    fn test_snapshot_tagging() {
        let snapshot: EntitySnapshot = product().into();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["entity_table"], "products");
        assert_eq!(json["record"]["sku"], "COKE-330");

        let back: EntitySnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.table(), EntityTable::Products);
        assert!(Product::from_snapshot(back.clone()).is_ok());
        assert!(Sale::from_snapshot(back).is_err());
    }

    #[test]
    fn test_sale_item_foreign_keys_are_rewritable() {
        let mut item = SaleItem {
            id: new_local_id(),
            remote_id: None,
            sale_id: "sale-local".into(),
            product_id: "product-local".into(),
            sku_snapshot: "COKE-330".into(),
            name_snapshot: "Coca-Cola".into(),
            quantity: 1,
            unit_price_cents: 1599,
            line_total_cents: 1599,
            sync_status: SyncStatus::Pending,
            updated_at: Utc::now(),
        };
        for (table, key) in item.foreign_keys_mut() {
            *key = format!("remote-{}", table);
        }
        assert_eq!(item.sale_id, "remote-sales");
        assert_eq!(item.product_id, "remote-products");
    }
}
