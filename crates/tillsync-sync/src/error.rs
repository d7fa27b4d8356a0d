//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Connectivity   │  │   Authority     │  │     Local               │ │
//! │  │  (retryable)    │  │   (terminal)    │  │                         │ │
//! │  │                 │  │                 │  │  LocalStoreFailure      │ │
//! │  │  NoNetwork      │  │  Authority-     │  │  DependencyPending      │ │
//! │  │  Unreachable    │  │  Rejected       │  │  Domain                 │ │
//! │  │  Timeout        │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │  Configuration  │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  InvalidConfig  │  │  Serialization  │                              │
//! │  │  MissingDeviceId│  │  ChannelError   │                              │
//! │  │  InvalidUrl     │  │  ShuttingDown   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Push Handling
//! ```text
//! is_retryable()  → mark_failed: retry_count += 1, backoff
//! is_terminal()   → mark_rejected: dead letter, no retry
//! DependencyPending → defer: wait for the parent, no attempt counted
//! ```

use thiserror::Error;

use tillsync_core::{CoreError, EntityTable};
use tillsync_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Connectivity Errors
    // =========================================================================
    /// The link is down.
    #[error("No network connection")]
    NoNetwork,

    /// The link is up but the authority could not be reached.
    #[error("Authority unreachable: {0}")]
    Unreachable(String),

    /// A network call exceeded its bound.
    #[error("{operation} timed out after {secs} seconds")]
    Timeout { operation: String, secs: u64 },

    // =========================================================================
    // Authority Errors
    // =========================================================================
    /// The authority refused the request (4xx-class business failure).
    #[error("Authority rejected request ({status}): {message}")]
    AuthorityRejected { status: u16, message: String },

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// A Local Store transaction or constraint failed.
    #[error("Local store failure: {0}")]
    LocalStoreFailure(#[from] DbError),

    /// A referenced parent row has not been pushed yet.
    #[error("{table} {local_id} waits for its parent to be pushed")]
    DependencyPending { table: EntityTable, local_id: String },

    /// Domain rule violated.
    #[error(transparent)]
    Domain(#[from] CoreError),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for sync).
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Invalid authority URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Failed to encode or decode a record.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// The orchestrator is shutting down.
    #[error("Sync orchestrator is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout {
                operation: "request".into(),
                secs: 0,
            }
        } else if let Some(status) = err.status() {
            SyncError::from_status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            SyncError::SerializationFailed(err.to_string())
        } else {
            SyncError::Unreachable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Maps an HTTP status from the authority.
    ///
    /// ## Mapping
    /// - 408, 429, 5xx → `Unreachable` (try again later)
    /// - other 4xx → `AuthorityRejected`
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 => SyncError::Unreachable(format!("{}: {}", status, message)),
            400..=499 => SyncError::AuthorityRejected { status, message },
            _ => SyncError::Unreachable(format!("{}: {}", status, message)),
        }
    }

    /// Returns true if the affected queue item should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NoNetwork | SyncError::Unreachable(_) | SyncError::Timeout { .. }
        )
    }

    /// Returns true if retrying can never help.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::AuthorityRejected { .. })
    }

    /// Returns true if the authority is gone for now, so pushing further
    /// items in this run is pointless.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::NoNetwork | SyncError::Unreachable(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
