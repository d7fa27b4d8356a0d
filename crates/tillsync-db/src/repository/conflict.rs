//! # Conflict Record Repository
//!
//! Append-only audit trail of conflict resolutions. The table rejects
//! UPDATE and DELETE at the SQL level.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use tillsync_core::{ConflictRecord, ConflictStrategy, EntityTable};

use crate::error::{DbError, DbResult};

#[derive(Debug, FromRow)]
struct ConflictRow {
    id: String,
    entity_table: EntityTable,
    remote_id: String,
    local_id: String,
    local_snapshot: String,
    remote_snapshot: String,
    diverging_fields: String,
    strategy_applied: ConflictStrategy,
    resolved_at: DateTime<Utc>,
}

impl TryFrom<ConflictRow> for ConflictRecord {
    type Error = DbError;

    fn try_from(row: ConflictRow) -> Result<Self, Self::Error> {
        Ok(ConflictRecord {
            id: row.id,
            entity_table: row.entity_table,
            remote_id: row.remote_id,
            local_id: row.local_id,
            local_snapshot: serde_json::from_str(&row.local_snapshot)?,
            remote_snapshot: serde_json::from_str(&row.remote_snapshot)?,
            diverging_fields: serde_json::from_str(&row.diverging_fields)?,
            strategy_applied: row.strategy_applied,
            resolved_at: row.resolved_at,
        })
    }
}

/// Appends a record. Runs inside the resolver's transaction so the audit entry
/// lands before (and with) the resolved write.
pub async fn insert_conflict_on(conn: &mut SqliteConnection, record: &ConflictRecord) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO conflict_records (
            id, entity_table, remote_id, local_id, local_snapshot, remote_snapshot,
            diverging_fields, strategy_applied, resolved_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&record.id)
    .bind(record.entity_table)
    .bind(&record.remote_id)
    .bind(&record.local_id)
    .bind(serde_json::to_string(&record.local_snapshot)?)
    .bind(serde_json::to_string(&record.remote_snapshot)?)
    .bind(serde_json::to_string(&record.diverging_fields)?)
    .bind(record.strategy_applied)
    .bind(record.resolved_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

const SELECT_CONFLICT: &str = r#"
    SELECT id, entity_table, remote_id, local_id, local_snapshot, remote_snapshot,
           diverging_fields, strategy_applied, resolved_at
    FROM conflict_records
"#;

/// Repository for conflict records.
#[derive(Debug, Clone)]
pub struct ConflictRepository {
    pool: SqlitePool,
}

impl ConflictRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ConflictRepository { pool }
    }

    pub async fn insert(&self, record: &ConflictRecord) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_conflict_on(&mut *conn, record).await
    }

    /// Most recent records first.
    pub async fn recent(&self, limit: i64) -> DbResult<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(&format!(
            "{} ORDER BY resolved_at DESC, rowid DESC LIMIT ?1",
            SELECT_CONFLICT
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRecord::try_from).collect()
    }

    /// Every record for one logical record, oldest first.
    pub async fn for_record(&self, table: EntityTable, remote_id: &str) -> DbResult<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(&format!(
            "{} WHERE entity_table = ?1 AND remote_id = ?2 ORDER BY resolved_at, rowid",
            SELECT_CONFLICT
        ))
        .bind(table)
        .bind(remote_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRecord::try_from).collect()
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM conflict_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use tillsync_core::{Conflict, Product, SyncRecord};

    #[tokio::test]
    async fn test_records_are_append_only() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.conflicts();

        let mut local = Product::new("SKU", "Thing", 1000, 3);
        local.remote_id = Some("rp-1".into());
        let mut remote = local.clone();
        remote.price_cents = 1200;

        let conflict = Conflict {
            entity_table: EntityTable::Products,
            remote_id: "rp-1".into(),
            diverging_fields: vec!["price".into()],
            local: local.into_snapshot(),
            remote: remote.into_snapshot(),
        };
        let record = ConflictRecord::from_conflict(&conflict, ConflictStrategy::ServerWins);
        repo.insert(&record).await.unwrap();

        let stored = repo.for_record(EntityTable::Products, "rp-1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, record.id);
        assert_eq!(stored[0].diverging_fields, vec!["price".to_string()]);
        assert_eq!(stored[0].local_snapshot, record.local_snapshot);

        let update = sqlx::query("UPDATE conflict_records SET remote_id = 'x'")
            .execute(db.pool())
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM conflict_records").execute(db.pool()).await;
        assert!(delete.is_err());
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}
