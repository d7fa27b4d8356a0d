//! # Remote Shadow Repository
//!
//! The last authority-side snapshot of each mirrored record, keyed by
//! `(entity_table, remote_id)`. Conflict detection compares local rows
//! against these.
//!
//! Shadows are written on pull (what the authority sent), on push success
//! (what the authority accepted) and after a resolution (the agreed value).

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use tillsync_core::{EntitySnapshot, EntityTable};

use crate::error::DbResult;

/// One stored shadow.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteShadow {
    pub entity_table: EntityTable,
    pub remote_id: String,
    pub snapshot: EntitySnapshot,
    pub remote_updated_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ShadowRow {
    entity_table: EntityTable,
    remote_id: String,
    snapshot: String,
    remote_updated_at: DateTime<Utc>,
    fetched_at: DateTime<Utc>,
}

impl TryFrom<ShadowRow> for RemoteShadow {
    type Error = crate::error::DbError;

    fn try_from(row: ShadowRow) -> Result<Self, Self::Error> {
        Ok(RemoteShadow {
            entity_table: row.entity_table,
            remote_id: row.remote_id,
            snapshot: serde_json::from_str(&row.snapshot)?,
            remote_updated_at: row.remote_updated_at,
            fetched_at: row.fetched_at,
        })
    }
}

/// Stores `snapshot` as the shadow for `(table, remote_id)`.
pub async fn upsert_shadow_on(
    conn: &mut SqliteConnection,
    remote_id: &str,
    snapshot: &EntitySnapshot,
) -> DbResult<()> {
    let json = serde_json::to_string(snapshot)?;

    sqlx::query(
        r#"
        INSERT INTO remote_shadows (entity_table, remote_id, snapshot, remote_updated_at, fetched_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(entity_table, remote_id) DO UPDATE SET
            snapshot = excluded.snapshot,
            remote_updated_at = excluded.remote_updated_at,
            fetched_at = excluded.fetched_at
        "#,
    )
    .bind(snapshot.table())
    .bind(remote_id)
    .bind(json)
    .bind(snapshot.updated_at())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Reads the shadow for `(table, remote_id)`.
pub async fn get_shadow_on(
    conn: &mut SqliteConnection,
    table: EntityTable,
    remote_id: &str,
) -> DbResult<Option<RemoteShadow>> {
    let row: Option<ShadowRow> = sqlx::query_as(
        r#"
        SELECT entity_table, remote_id, snapshot, remote_updated_at, fetched_at
        FROM remote_shadows
        WHERE entity_table = ?1 AND remote_id = ?2
        "#,
    )
    .bind(table)
    .bind(remote_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(RemoteShadow::try_from).transpose()
}

/// Forgets the shadow for `(table, remote_id)`.
pub async fn delete_shadow_on(
    conn: &mut SqliteConnection,
    table: EntityTable,
    remote_id: &str,
) -> DbResult<()> {
    sqlx::query("DELETE FROM remote_shadows WHERE entity_table = ?1 AND remote_id = ?2")
        .bind(table)
        .bind(remote_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Repository for remote shadows.
#[derive(Debug, Clone)]
pub struct ShadowRepository {
    pool: SqlitePool,
}

impl ShadowRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ShadowRepository { pool }
    }

    pub async fn upsert(&self, remote_id: &str, snapshot: &EntitySnapshot) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_shadow_on(&mut *conn, remote_id, snapshot).await
    }

    pub async fn get(&self, table: EntityTable, remote_id: &str) -> DbResult<Option<RemoteShadow>> {
        let mut conn = self.pool.acquire().await?;
        get_shadow_on(&mut *conn, table, remote_id).await
    }

    pub async fn delete(&self, table: EntityTable, remote_id: &str) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        delete_shadow_on(&mut *conn, table, remote_id).await
    }

    /// All shadows of one table.
    pub async fn list(&self, table: EntityTable) -> DbResult<Vec<RemoteShadow>> {
        let rows: Vec<ShadowRow> = sqlx::query_as(
            r#"
            SELECT entity_table, remote_id, snapshot, remote_updated_at, fetched_at
            FROM remote_shadows
            WHERE entity_table = ?1
            ORDER BY remote_id
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RemoteShadow::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use tillsync_core::{Product, SyncRecord};

    #[tokio::test]
    async fn test_shadow_upsert_replaces() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let shadows = db.shadows();

        let mut product = Product::new("SKU", "Thing", 1000, 3);
        product.remote_id = Some("rp-1".into());
        shadows.upsert("rp-1", &product.clone().into_snapshot()).await.unwrap();

        product.price_cents = 1200;
        shadows.upsert("rp-1", &product.clone().into_snapshot()).await.unwrap();

        let shadow = shadows.get(EntityTable::Products, "rp-1").await.unwrap().unwrap();
        assert_eq!(Product::from_snapshot(shadow.snapshot).unwrap().price_cents, 1200);
        assert_eq!(shadows.list(EntityTable::Products).await.unwrap().len(), 1);

        shadows.delete(EntityTable::Products, "rp-1").await.unwrap();
        assert!(shadows.get(EntityTable::Products, "rp-1").await.unwrap().is_none());
    }
}
