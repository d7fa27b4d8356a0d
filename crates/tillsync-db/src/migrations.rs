//! Embedded schema for the Local Store.
//!
//! `migrations/sqlite/NNN_name.sql` files are compiled into the binary and
//! applied in order on open. Applied files are tracked in
//! `_sqlx_migrations`; an applied file must never change, so schema changes
//! always go in a new file.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Applies every embedded migration the store has not seen yet.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    let (known, applied) = (MIGRATOR.migrations.len(), applied_count(pool).await);
    if applied >= known {
        debug!(applied, "Schema up to date");
        return Ok(());
    }

    MIGRATOR.run(pool).await?;
    info!(from = applied, to = known, "Schema migrated");
    Ok(())
}

/// Number of successfully applied migrations; zero on a fresh store.
async fn applied_count(pool: &SqlitePool) -> usize {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await
        .map(|n| n as usize)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_reopening_applies_nothing_new() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert_eq!(applied_count(db.pool()).await, MIGRATOR.migrations.len());

        run_migrations(db.pool()).await.unwrap();
        assert_eq!(applied_count(db.pool()).await, MIGRATOR.migrations.len());
    }
}
