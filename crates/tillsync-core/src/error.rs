//! Errors raised by the pure domain layer.
//!
//! ```text
//! ValidationError ─► CoreError ─► DbError::Domain ─► SyncError::LocalStoreFailure
//! ```

use thiserror::Error;

use crate::types::EntityTable;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Product not found: {0}")]
    ProductNotFound(String),

    /// A table name read from storage or config is not one of the synced tables.
    #[error("Unknown entity table: {0}")]
    UnknownEntityTable(String),

    /// A snapshot was decoded as the wrong entity type.
    #[error("Snapshot mismatch: expected {expected}, got {actual}")]
    SnapshotMismatch {
        expected: EntityTable,
        actual: EntityTable,
    },

    /// Money arithmetic on a sale overflowed or went negative.
    #[error("Invalid payment amount: {reason}")]
    InvalidPaymentAmount { reason: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Rejections of caller input, raised before the Local Store is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },

    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
    },

    #[error("{field} must be positive")]
    MustBePositive { field: &'static str },

    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: &'static str, reason: String },
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_mismatch_names_both_tables() {
        let err = CoreError::SnapshotMismatch {
            expected: EntityTable::Sales,
            actual: EntityTable::Products,
        };
        assert_eq!(err.to_string(), "Snapshot mismatch: expected sales, got products");
    }

    #[test]
    fn test_validation_error_wraps_into_core_error() {
        let core: CoreError = ValidationError::Required { field: "lines" }.into();
        assert!(matches!(core, CoreError::Validation(ValidationError::Required { field: "lines" })));
        assert_eq!(core.to_string(), "Validation error: lines is required");
    }
}
