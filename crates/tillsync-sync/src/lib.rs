//! # tillsync-sync: Sync Engine for Tillsync
//!
//! Reconciles the till's Local Store with the remote authority: network
//! monitoring, the Change Queue, pull/push runs and conflict resolution,
//! behind a single facade for the UI layer.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  UI layer ──► SyncFacade ── read / write / force_sync / status          │
//! │                   │   ▲                                                 │
//! │                   │   └── event bridge ── SyncEventEmitter              │
//! │                   ▼                                                     │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                       SyncOrchestrator                           │  │
//! │  │  Idle ──trigger──► Syncing ──► Idle      (single flight)         │  │
//! │  │  reachability → pull → push → conflicts → SyncRun                │  │
//! │  └───────┬──────────────┬───────────────┬──────────────┬────────────┘  │
//! │          ▼              ▼               ▼              ▼                │
//! │  ┌──────────────┐ ┌────────────┐ ┌─────────────┐ ┌──────────────────┐  │
//! │  │NetworkMonitor│ │ChangeQueue │ │ Authority   │ │ConflictResolver  │  │
//! │  │ link watch,  │ │ batches,   │ │ REST via    │ │ per-table policy,│  │
//! │  │ reachability │ │ backoff,   │ │ reqwest     │ │ audit records    │  │
//! │  │ probes       │ │ stats      │ │             │ │                  │  │
//! │  └──────────────┘ └─────┬──────┘ └─────────────┘ └────────┬─────────┘  │
//! │                         └──────────────┬──────────────────┘            │
//! │                                        ▼                                │
//! │                          tillsync-db (Local Store)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Sync configuration (device, authority, intervals, policy)
//! - [`error`] - Sync error types
//! - [`authority`] - Remote authority contract and its HTTP client
//! - [`monitor`] - Link state and reachability
//! - [`queue`] - Change Queue handle with stats and pending signal
//! - [`mirror`] - Applying pulled records to the Local Store
//! - [`conflict`] - Conflict detection and resolution
//! - [`orchestrator`] - Run phases and the trigger loop
//! - [`facade`] - UI entry point and event bridge
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tillsync_sync::{SyncConfig, SyncFacade, SyncOrchestrator};
//!
//! let config = SyncConfig::load_or_default(None);
//! let orchestrator = SyncOrchestrator::new(db, authority, monitor, queue, resolver, settings);
//! let handle = orchestrator.spawn();
//!
//! let facade = SyncFacade::new(orchestrator);
//! let written = facade.write(product.into_snapshot()).await?;
//! println!("Queued {} (will sync: {})", written.local_id, written.will_sync);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod authority;
pub mod config;
pub mod conflict;
pub mod error;
pub mod facade;
pub mod mirror;
pub mod monitor;
pub mod orchestrator;
pub mod queue;

// =============================================================================
// Re-exports
// =============================================================================

pub use authority::{decode_record, encode_record, HttpAuthority, RemoteAuthority, RemoteRecord};
pub use config::{AuthoritySettings, ConflictSettings, NetworkSettings, SyncConfig, SyncSettings};
pub use conflict::{ConflictResolver, Resolution};
pub use error::{SyncError, SyncResult};
pub use facade::{NoOpEmitter, ReadResult, SyncEventEmitter, SyncFacade, TracingEmitter, WriteResult};
pub use mirror::{apply_remote_records, PullOutcome};
pub use monitor::{HttpProber, LinkProbe, LinkState, NetworkEvent, NetworkMonitor, Prober, Reachability, UdpRouteProbe};
pub use orchestrator::{OrchestratorHandle, OrchestratorSettings, SyncEvent, SyncOrchestrator};
pub use queue::ChangeQueue;
