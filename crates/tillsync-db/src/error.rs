//! # Local Store Errors
//!
//! ```text
//! sqlx::Error ───────┐
//! MigrateError ──────┼──► DbError ──► SyncError::LocalStoreFailure ──► facade caller
//! CoreError ─────────┘
//! ```
//!
//! Constraint failures are classified by SQLite's error kind, never by
//! parsing the message text.

use sqlx::error::ErrorKind;
use thiserror::Error;
use tillsync_core::CoreError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{table} not found: {id}")]
    NotFound { table: String, id: String },

    /// Usually two local rows claiming one remote identifier.
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// A child row points at a missing parent, or a parent still has children.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// The guarded stock decrement matched no row.
    #[error("Insufficient stock for {sku}: available {available}, requested {requested}")]
    InsufficientStock {
        sku: String,
        available: i64,
        requested: i64,
    },

    /// Rejected by a business rule before any SQL ran.
    #[error(transparent)]
    Domain(#[from] CoreError),

    #[error("Cannot open Local Store: {0}")]
    ConnectionFailed(String),

    #[error("Schema migration failed: {0}")]
    MigrationFailed(String),

    #[error("Statement failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// A JSON column (queue payload, snapshot) did not round-trip.
    #[error("Bad JSON column: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No free connection in the pool")]
    PoolExhausted,

    #[error("Local Store error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(table: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            table: table.into(),
            id: id.into(),
        }
    }

    /// True when the data was at fault rather than the store.
    pub fn is_constraint(&self) -> bool {
        matches!(
            self,
            DbError::UniqueViolation { .. }
                | DbError::ForeignKeyViolation { .. }
                | DbError::InsufficientStock { .. }
                | DbError::Domain(_)
        )
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("row", "?"),
            sqlx::Error::Database(db_err) => match db_err.kind() {
                ErrorKind::UniqueViolation => DbError::UniqueViolation {
                    constraint: db_err.message().to_string(),
                },
                ErrorKind::ForeignKeyViolation => DbError::ForeignKeyViolation {
                    message: db_err.message().to_string(),
                },
                _ => DbError::QueryFailed(db_err.message().to_string()),
            },
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool closed".to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[test]
    fn test_stock_shortfall_is_a_constraint_failure() {
        let err = DbError::InsufficientStock {
            sku: "COKE-330".into(),
            available: 0,
            requested: 1,
        };
        assert!(err.is_constraint());
        assert!(!DbError::PoolExhausted.is_constraint());
        assert_eq!(DbError::not_found("products", "p-1").to_string(), "products not found: p-1");
    }

    #[tokio::test]
    async fn test_sqlite_constraint_kinds_are_classified() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let orphan = sqlx::query(
            "INSERT INTO sale_items (id, sale_id, product_id, sku_snapshot, name_snapshot, quantity, \
             unit_price_cents, line_total_cents, updated_at) \
             VALUES ('i-1', 'missing', 'p-1', 'SKU', 'Thing', 1, 100, 100, '2026-01-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .unwrap_err();
        assert!(matches!(DbError::from(orphan), DbError::ForeignKeyViolation { .. }));
    }
}
