//! # Sync Run Repository
//!
//! Append-only audit of orchestrator runs, and the pull cursor derived from it.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use tillsync_core::SyncRun;

use crate::error::DbResult;

const SELECT_RUN: &str = r#"
    SELECT id, trigger_source, started_at, completed_at, pulled_count, pushed_count,
           conflict_count, outcome, pull_succeeded, error
    FROM sync_runs
"#;

/// Repository for sync run records.
#[derive(Debug, Clone)]
pub struct SyncRunRepository {
    pool: SqlitePool,
}

impl SyncRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncRunRepository { pool }
    }

    /// Appends a finished run.
    pub async fn record(&self, run: &SyncRun) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                id, trigger_source, started_at, completed_at, pulled_count, pushed_count,
                conflict_count, outcome, pull_succeeded, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&run.id)
        .bind(run.trigger)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.pulled_count)
        .bind(run.pushed_count)
        .bind(run.conflict_count)
        .bind(run.outcome)
        .bind(run.pull_succeeded)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;

        debug!(run = %run.id, outcome = ?run.outcome, "Recorded sync run");
        Ok(())
    }

    /// Most recent runs first.
    pub async fn recent(&self, limit: i64) -> DbResult<Vec<SyncRun>> {
        let runs = sqlx::query_as::<_, SyncRun>(&format!(
            "{} ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            SELECT_RUN
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    /// Latest run whose outcome was `success`.
    pub async fn last_successful(&self) -> DbResult<Option<SyncRun>> {
        let run = sqlx::query_as::<_, SyncRun>(&format!(
            "{} WHERE outcome = 'success' ORDER BY started_at DESC, rowid DESC LIMIT 1",
            SELECT_RUN
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    /// Timestamp the next pull resumes from: the start of the latest run whose
    /// pull phase completed. `None` means pull everything.
    pub async fn last_pull_cursor(&self) -> DbResult<Option<DateTime<Utc>>> {
        let cursor: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT started_at FROM sync_runs
            WHERE pull_succeeded = 1
            ORDER BY started_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(cursor)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM sync_runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use tillsync_core::{SyncOutcome, SyncTrigger};

    #[tokio::test]
    async fn test_pull_cursor_follows_completed_pulls() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let runs = db.sync_runs();
        assert!(runs.last_pull_cursor().await.unwrap().is_none());

        let mut pulled = SyncRun::begin(SyncTrigger::Periodic);
        pulled.pull_succeeded = true;
        pulled.outcome = SyncOutcome::Partial;
        runs.record(&pulled).await.unwrap();

        let mut offline = SyncRun::begin(SyncTrigger::Forced);
        offline.outcome = SyncOutcome::Failure;
        runs.record(&offline).await.unwrap();

        let cursor = runs.last_pull_cursor().await.unwrap().unwrap();
        assert_eq!(cursor.timestamp_millis(), pulled.started_at.timestamp_millis());
        assert!(runs.last_successful().await.unwrap().is_none());

        let recent = runs.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, offline.id);
        assert_eq!(recent[0].trigger, SyncTrigger::Forced);
    }
}
