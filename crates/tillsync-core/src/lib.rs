//! # tillsync-core: Pure Domain Types for Tillsync
//!
//! Everything the Local Store and the sync engine agree on, with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tillsync Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │             UI layer (excluded; consumes the Facade)            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ read / write / forceSync / events      │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │      tillsync-sync: monitor, queue, resolver, orchestrator      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tillsync-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   queue   │  │ conflict  │  │  status   │  │   │
//! │  │   │ entities  │  │ QueueItem │  │ strategies│  │  SyncRun  │  │   │
//! │  │   │ snapshots │  │  backoff  │  │  records  │  │  events   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 tillsync-db (Local Store)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Entities, [`EntitySnapshot`], the [`SyncRecord`] trait
//! - [`queue`] - Change Queue items, ordering and the backoff table
//! - [`conflict`] - Strategies, the per-table policy, audit records
//! - [`status`] - Sync runs and UI status payloads
//! - [`money`] - Integer-cent money
//! - [`validation`] - Input validation
//! - [`error`] - Domain error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod error;
pub mod money;
pub mod queue;
pub mod status;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::{
    resolve_pair, Conflict, ConflictPolicy, ConflictRecord, ConflictStrategy, ConflictSummary,
    ConflictsResolved, Winner,
};
pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use queue::{
    backoff_for, Operation, Priority, QueueItem, QueueMutation, QueueStatus, BACKOFF_SCHEDULE_SECS,
    MAX_RETRIES,
};
pub use status::{DataSource, QueueStats, SyncOutcome, SyncRun, SyncStatusUpdate, SyncTrigger};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum lines in a single sale.
pub const MAX_SALE_LINES: usize = 100;

/// Maximum quantity of a single line.
///
/// ## Business Reason
/// Prevents accidental over-ringing (e.g., typing 1000 instead of 10).
pub const MAX_ITEM_QUANTITY: i64 = 999;
