//! # Pull Application
//!
//! Applies authority records to the Local Store, keyed by remote identifier.
//!
//! ## Per-record Decision
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  RemoteRecord ── decode ── FK remote→local ──┬── parent unknown → skip  │
//! │                                              │                          │
//! │                                              ▼                          │
//! │                              local row with this remote_id?             │
//! │                    ┌─────────────────┬───────┴──────────────────┐       │
//! │                  none            synced                  pending/...    │
//! │                    │                 │                 ┌────────┴─────┐ │
//! │             insert mirror     overwrite,       same fields or   diverges│
//! │             (new local id)    keep local id    upstream unmoved   and   │
//! │                    │                 │                 │       upstream │
//! │                    │                 │           shadow only    moved:  │
//! │                    │                 │                 │       conflict │
//! │                    └─────────────────┴────────┬────────┴─────────────┘  │
//! │                                               ▼                         │
//! │                                  remote shadow = pulled record          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each record commits in its own transaction, so a failure part-way through
//! a page keeps everything applied before it.

use sqlx::SqliteConnection;
use tracing::{debug, warn};

use tillsync_core::{new_local_id, EntityTable, SyncRecord, SyncStatus};
use tillsync_db::repository::queue::open_items_for_entity_on;
use tillsync_db::repository::shadow::{delete_shadow_on, get_shadow_on, upsert_shadow_on};
use tillsync_db::store::{
    delete_row, fetch_by_remote_id, insert_row, local_id_of, set_sync_state, upsert_row,
};
use tillsync_db::{with_entity_type, Database, DbError, DbResult, StoredEntity};

use crate::authority::{decode_record, RemoteRecord};
use crate::error::SyncResult;

/// Totals of one pulled page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOutcome {
    /// Records inserted, overwritten or compared.
    pub applied: usize,
    /// Local mirrors removed by tombstones.
    pub removed: usize,
    /// Records that could not be applied (bad shape, unknown parent).
    pub skipped: usize,
    /// Local ids of rows flagged `conflict`.
    pub diverged: Vec<String>,
}

enum Applied {
    Written,
    Diverged(String),
    MissingParent(EntityTable),
}

/// Applies `records` of one table.
pub async fn apply_remote_records(
    db: &Database,
    table: EntityTable,
    records: &[RemoteRecord],
) -> SyncResult<PullOutcome> {
    with_entity_type!(table, E => apply_typed::<E>(db, records).await)
}

async fn apply_typed<E: StoredEntity>(db: &Database, records: &[RemoteRecord]) -> SyncResult<PullOutcome> {
    let mut outcome = PullOutcome::default();

    for record in records {
        if record.deleted {
            if apply_tombstone::<E>(db, record.remote_id.clone()).await? {
                outcome.removed += 1;
            }
            continue;
        }

        let remote: E = match decode_record(record) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(entity_table = %E::TABLE, remote_id = %record.remote_id, error = %e, "Skipping undecodable record");
                outcome.skipped += 1;
                continue;
            }
        };

        match apply_one(db, remote).await? {
            Applied::Written => outcome.applied += 1,
            Applied::Diverged(local_id) => {
                outcome.applied += 1;
                outcome.diverged.push(local_id);
            }
            Applied::MissingParent(parent) => {
                debug!(
                    entity_table = %E::TABLE,
                    remote_id = %record.remote_id,
                    parent = %parent,
                    "Skipping record with unknown parent"
                );
                outcome.skipped += 1;
            }
        }
    }

    Ok(outcome)
}

/// Applies one decoded record. A `synced` row carries no local edits, so it
/// is overwritten without a conflict even when its fields differ.
async fn apply_one<E: StoredEntity>(db: &Database, mut remote: E) -> DbResult<Applied> {
    db.transaction(move |conn: &mut SqliteConnection| {
        Box::pin(async move {
            for (parent, key) in remote.foreign_keys_mut() {
                match local_id_of(&mut *conn, parent, key.as_str()).await? {
                    Some(local_id) => *key = local_id,
                    None => return Ok(Applied::MissingParent(parent)),
                }
            }

            let remote_id = match remote.remote_id() {
                Some(remote_id) => remote_id.to_string(),
                None => return Ok(Applied::Written),
            };
            remote.set_sync_status(SyncStatus::Synced);

            let local = match fetch_by_remote_id::<E>(&mut *conn, &remote_id).await? {
                Some(local) => local,
                None => {
                    remote.set_id(new_local_id());
                    insert_row(&mut *conn, &remote).await?;
                    upsert_shadow_on(&mut *conn, &remote_id, &remote.into_snapshot()).await?;
                    return Ok(Applied::Written);
                }
            };

            remote.set_id(local.id().to_string());

            if local.sync_status() == SyncStatus::Synced {
                upsert_row(&mut *conn, &remote).await?;
                upsert_shadow_on(&mut *conn, &remote_id, &remote.into_snapshot()).await?;
                return Ok(Applied::Written);
            }

            // Local edits in flight: never overwrite, only refresh the shadow.
            // An echo of the shadow means the authority has not moved, and the
            // queued push will carry the local edits.
            let upstream_moved = match get_shadow_on(&mut *conn, E::TABLE, &remote_id).await? {
                Some(shadow) => !E::from_snapshot(shadow.snapshot)?
                    .diverging_fields(&remote)
                    .is_empty(),
                None => true,
            };
            let diverging = local.diverging_fields(&remote);
            upsert_shadow_on(&mut *conn, &remote_id, &remote.into_snapshot()).await?;
            if diverging.is_empty() || !upstream_moved {
                return Ok(Applied::Written);
            }

            set_sync_state(&mut *conn, E::TABLE, local.id(), None, SyncStatus::Conflict).await?;
            debug!(
                entity_table = %E::TABLE,
                local_id = %local.id(),
                fields = ?diverging,
                "Local edits diverge from authority"
            );
            Ok(Applied::Diverged(local.id().to_string()))
        })
    })
    .await
}

/// Forgets the shadow and removes a clean local mirror.
///
/// ## Returns
/// `true` if a local row was deleted.
async fn apply_tombstone<E: StoredEntity>(db: &Database, remote_id: String) -> DbResult<bool> {
    db.transaction(move |conn: &mut SqliteConnection| {
        Box::pin(async move {
            delete_shadow_on(&mut *conn, E::TABLE, &remote_id).await?;

            let local = match fetch_by_remote_id::<E>(&mut *conn, &remote_id).await? {
                Some(local) => local,
                None => return Ok(false),
            };

            let open = open_items_for_entity_on(&mut *conn, E::TABLE, local.id(), None).await?;
            if local.sync_status() != SyncStatus::Synced || open > 0 {
                debug!(entity_table = %E::TABLE, local_id = %local.id(), "Keeping locally modified row");
                return Ok(false);
            }

            match delete_row(&mut *conn, E::TABLE, local.id()).await {
                Ok(deleted) => Ok(deleted),
                Err(DbError::ForeignKeyViolation { .. }) => {
                    warn!(
                        entity_table = %E::TABLE,
                        local_id = %local.id(),
                        "Remote delete blocked by dependent local rows"
                    );
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        })
    })
    .await
}
