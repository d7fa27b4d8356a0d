//! # Local Store Handle
//!
//! Opening the till's SQLite file and handing out the pool.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Opening the Store                             │
//! │                                                                         │
//! │  DbConfig::new(path)          DbConfig::in_memory()                    │
//! │       │  pool_size 4               │  pool_size 1, never reaped        │
//! │       └──────────────┬─────────────┘                                    │
//! │                      ▼                                                  │
//! │  Database::new ── journal=WAL, synchronous=NORMAL, foreign_keys=ON,    │
//! │                   busy_timeout (UI process and agent share the file)   │
//! │                      │                                                  │
//! │                      ▼                                                  │
//! │               embedded migrations                                       │
//! │                      │                                                  │
//! │       ┌──────────────┼──────────────┬──────────────┐                    │
//! │       ▼              ▼              ▼              ▼                    │
//! │   queue()       shadows()     conflicts()     sync_runs()               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An in-memory store lives exactly as long as its one connection, so that
//! connection is kept open with no idle or lifetime limit. Code holding a
//! connection from an in-memory pool must release it before calling any
//! other `Database` method.

use futures_util::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqlitePool};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::conflict::ConflictRepository;
use crate::repository::queue::QueueRepository;
use crate::repository::shadow::ShadowRepository;
use crate::repository::sync_run::SyncRunRepository;

// =============================================================================
// Configuration
// =============================================================================

/// Where the Local Store lives and how the pool is sized.
#[derive(Debug, Clone, PartialEq)]
pub struct DbConfig {
    /// Database file, or `None` for a private in-memory store.
    pub path: Option<PathBuf>,
    pub pool_size: u32,
    /// How long a caller waits for a free connection.
    pub acquire_timeout: Duration,
    /// How long SQLite waits on a lock held by another process.
    pub busy_timeout: Duration,
    pub migrate: bool,
}

impl DbConfig {
    /// A file-backed store at `path`; the file is created on first open.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            path: Some(path.into()),
            pool_size: 4,
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
            migrate: true,
        }
    }

    /// A throwaway store for tests.
    pub fn in_memory() -> Self {
        DbConfig {
            path: None,
            pool_size: 1,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(1),
            migrate: true,
        }
    }

    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Opens the store as-is, leaving the schema untouched.
    pub fn skip_migrations(mut self) -> Self {
        self.migrate = false;
        self
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        let options = match &self.path {
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal),
            None => SqliteConnectOptions::new().in_memory(true),
        };
        options
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout)
    }
}

// =============================================================================
// Database
// =============================================================================

/// The Local Store handle.
///
/// Cheap to clone; every clone shares the pool. The generic entity contract
/// (`insert`, `update`, `delete`, `query`) lives in [`crate::store`], sale
/// creation in [`crate::repository::sale`].
///
/// ```rust,ignore
/// let db = Database::new(DbConfig::new("./till.db")).await?;
/// let id = db.insert(Product::new("COKE-330", "Coca-Cola 330ml", 150, 24)).await?;
/// let due = db.queue().dequeue_batch(25, Utc::now()).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the store described by `config` and brings its schema up to date.
    ///
    /// ## Returns
    /// * `Err(DbError::ConnectionFailed)` - the file could not be opened
    /// * `Err(DbError::MigrationFailed)` - the schema could not be applied
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let location = config
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string());

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .min_connections(1)
            .acquire_timeout(config.acquire_timeout);
        if config.path.is_none() {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(config.connect_options())
            .await
            .map_err(|e| DbError::ConnectionFailed(format!("{}: {}", location, e)))?;

        info!(path = %location, pool_size = config.pool_size, "Local Store opened");

        let db = Database { pool };
        if config.migrate {
            migrations::run_migrations(&db.pool).await?;
        }
        Ok(db)
    }

    /// The underlying pool, for repositories and ad-hoc statements.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. Every write `f`
    /// makes through the connection it is handed is all-or-nothing.
    ///
    /// ## Example
    /// ```rust,ignore
    /// db.transaction(|conn: &mut SqliteConnection| {
    ///     Box::pin(async move {
    ///         insert_row(&mut *conn, &sale).await?;
    ///         enqueue_change_on(&mut *conn, mutation).await
    ///     })
    /// })
    /// .await?;
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Rolling back transaction");
                tx.rollback()
                    .await
                    .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Returns the Change Queue repository.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let stats = db.queue().stats().await?;
    /// ```
    pub fn queue(&self) -> QueueRepository {
        QueueRepository::new(self.pool.clone())
    }

    /// Returns the remote shadow repository.
    pub fn shadows(&self) -> ShadowRepository {
        ShadowRepository::new(self.pool.clone())
    }

    /// Returns the conflict record repository.
    pub fn conflicts(&self) -> ConflictRepository {
        ConflictRepository::new(self.pool.clone())
    }

    pub fn sync_runs(&self) -> SyncRunRepository {
        SyncRunRepository::new(self.pool.clone())
    }

    /// Waits for checked-out connections and closes the pool.
    pub async fn close(&self) {
        debug!("Closing Local Store");
        self.pool.close().await;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
