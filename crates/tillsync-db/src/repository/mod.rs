//! # Repository Module
//!
//! Sync bookkeeping repositories and the sale transaction.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Database                                                               │
//! │  ├── queue()      → QueueRepository      (queue_items)                  │
//! │  ├── shadows()    → ShadowRepository     (remote_shadows)               │
//! │  ├── conflicts()  → ConflictRepository   (conflict_records, append)     │
//! │  ├── sync_runs()  → SyncRunRepository    (sync_runs, append)            │
//! │  └── sales()      → SaleRepository       (sale reads)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each module also exposes `*_on(&mut SqliteConnection, ..)` functions so
//! that callers can compose them inside one transaction.

pub mod conflict;
pub mod queue;
pub mod sale;
pub mod shadow;
pub mod sync_run;
