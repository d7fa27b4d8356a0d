//! # tillsync-db: Local Store
//!
//! Durable on-device storage for the till: business entity mirrors, the
//! Change Queue, remote shadows and the append-only audit trails. SQLite via
//! sqlx, WAL mode, migrations embedded.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tillsync Data Flow                               │
//! │                                                                         │
//! │  Facade (till writes)         Orchestrator (pull / resolve / push)      │
//! │       │                              │                                  │
//! │       ▼                              ▼                                  │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   tillsync-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │    store      │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │ insert/update │    │  (embedded)  │  │   │
//! │  │   │               │    │ delete/query  │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ + enqueue     │    │ 001_init.sql │  │   │
//! │  │   │ transaction() │    ├───────────────┤    │              │  │   │
//! │  │   │               │◄───│ repositories  │    │              │  │   │
//! │  │   └───────────────┘    │ queue, shadow │    └──────────────┘  │   │
//! │  │                        │ conflict, run │                       │   │
//! │  │                        │ sale          │                       │   │
//! │  │                        └───────────────┘                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (till.db)                   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool, configuration and the transaction primitive
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`store`] - Generic entity persistence and the write contract
//! - [`repository`] - Queue, shadow, conflict, sync run and sale repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tillsync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/till.db")).await?;
//! let id = db.insert(Product::new("COKE-330", "Coca-Cola 330ml", 150, 24)).await?;
//! let sale = db.create_sale(new_sale).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use store::{EntityFilter, StoredEntity};

pub use repository::conflict::ConflictRepository;
pub use repository::queue::QueueRepository;
pub use repository::sale::{RecordedSale, SaleRepository};
pub use repository::shadow::{RemoteShadow, ShadowRepository};
pub use repository::sync_run::SyncRunRepository;
