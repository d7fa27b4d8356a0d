//! # Conflict Policy
//!
//! Strategies for reconciling a local row with its authority counterpart,
//! and the pure function that applies them.
//!
//! ## Strategies
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  local row  ◄── matched by remote_id ──►  remote shadow                 │
//! │       │                                        │                        │
//! │       └──────── diverging_fields() ────────────┘                        │
//! │                        │ non-empty                                      │
//! │                        ▼                                                │
//! │   server_wins     remote snapshot, local row id kept                    │
//! │   local_wins      local snapshot, pushed again                          │
//! │   timestamp_wins  later updated_at wins, tie → server_wins              │
//! │   merge           SyncRecord::merge (entity-specific field rules)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The default table assignment is products / cashier orders → server_wins,
//! sales / sale items → local_wins, stock movements → timestamp_wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::CoreError;
use crate::types::{new_local_id, EntitySnapshot, EntityTable, SyncRecord};

// =============================================================================
// Strategy
// =============================================================================

/// How to pick the winner of a divergent pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ConflictStrategy {
    ServerWins,
    LocalWins,
    TimestampWins,
    Merge,
}

impl ConflictStrategy {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::LocalWins => "local_wins",
            ConflictStrategy::TimestampWins => "timestamp_wins",
            ConflictStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server_wins" => Ok(ConflictStrategy::ServerWins),
            "local_wins" => Ok(ConflictStrategy::LocalWins),
            "timestamp_wins" => Ok(ConflictStrategy::TimestampWins),
            "merge" => Ok(ConflictStrategy::Merge),
            other => Err(CoreError::Validation(
                crate::error::ValidationError::InvalidFormat {
                    field: "conflict strategy",
                    reason: format!("unknown strategy '{}'", other),
                },
            )),
        }
    }
}

// =============================================================================
// Policy Table
// =============================================================================

/// Per-table strategy assignment, passed to the resolver at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictPolicy {
    strategies: HashMap<EntityTable, ConflictStrategy>,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        let strategies = EntityTable::ALL
            .iter()
            .map(|t| (*t, Self::default_for(*t)))
            .collect();
        ConflictPolicy { strategies }
    }
}

impl ConflictPolicy {
    /// Built-in strategy for a table.
    pub const fn default_for(table: EntityTable) -> ConflictStrategy {
        match table {
            EntityTable::Products | EntityTable::CashierOrders => ConflictStrategy::ServerWins,
            EntityTable::Sales | EntityTable::SaleItems => ConflictStrategy::LocalWins,
            EntityTable::StockMovements => ConflictStrategy::TimestampWins,
        }
    }

    /// Replaces the strategy for one table.
    pub fn with(mut self, table: EntityTable, strategy: ConflictStrategy) -> Self {
        self.strategies.insert(table, strategy);
        self
    }

    pub fn strategy_for(&self, table: EntityTable) -> ConflictStrategy {
        self.strategies
            .get(&table)
            .copied()
            .unwrap_or_else(|| Self::default_for(table))
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Which side a resolution ended up equal to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// The resolved record equals the authority's copy. Nothing to push.
    Remote,
    /// The resolved record differs from the authority's copy and must be
    /// pushed as an update.
    Local,
}

/// Applies `strategy` to a divergent pair.
///
/// The returned record always carries the local row id and the remote
/// identifier, so writing it back is an in-place update of the local row.
pub fn resolve_pair<R: SyncRecord>(local: &R, remote: &R, strategy: ConflictStrategy) -> (R, Winner) {
    let mut resolved = match strategy {
        ConflictStrategy::ServerWins => remote.clone(),
        ConflictStrategy::LocalWins => local.clone(),
        ConflictStrategy::TimestampWins => {
            if local.updated_at() > remote.updated_at() {
                local.clone()
            } else {
                remote.clone()
            }
        }
        ConflictStrategy::Merge => R::merge(local, remote),
    };

    resolved.set_id(local.id().to_string());
    if resolved.remote_id().is_none() {
        resolved.set_remote_id(remote.remote_id().map(str::to_string));
    }

    let winner = if resolved.diverging_fields(remote).is_empty() {
        Winner::Remote
    } else {
        Winner::Local
    };
    (resolved, winner)
}

// =============================================================================
// Records
// =============================================================================

/// A detected divergence waiting to be resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub entity_table: EntityTable,
    pub remote_id: String,
    pub local: EntitySnapshot,
    pub remote: EntitySnapshot,
    pub diverging_fields: Vec<String>,
}

impl Conflict {
    /// Identity of the conflicting pair for once-per-cycle bookkeeping.
    pub fn pair_key(&self) -> (EntityTable, String) {
        (self.entity_table, self.remote_id.clone())
    }
}

/// Immutable audit entry written before a resolution is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConflictRecord {
    pub id: String,
    pub entity_table: EntityTable,
    pub remote_id: String,
    pub local_id: String,
    pub local_snapshot: EntitySnapshot,
    pub remote_snapshot: EntitySnapshot,
    pub diverging_fields: Vec<String>,
    pub strategy_applied: ConflictStrategy,
    #[ts(as = "String")]
    pub resolved_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn from_conflict(conflict: &Conflict, strategy: ConflictStrategy) -> Self {
        ConflictRecord {
            id: new_local_id(),
            entity_table: conflict.entity_table,
            remote_id: conflict.remote_id.clone(),
            local_id: conflict.local.local_id().to_string(),
            local_snapshot: conflict.local.clone(),
            remote_snapshot: conflict.remote.clone(),
            diverging_fields: conflict.diverging_fields.clone(),
            strategy_applied: strategy,
            resolved_at: Utc::now(),
        }
    }
}

/// UI-facing summary of one resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConflictSummary {
    pub entity_table: EntityTable,
    pub remote_id: String,
    pub diverging_fields: Vec<String>,
    pub strategy_applied: ConflictStrategy,
}

impl From<&ConflictRecord> for ConflictSummary {
    fn from(record: &ConflictRecord) -> Self {
        ConflictSummary {
            entity_table: record.entity_table,
            remote_id: record.remote_id.clone(),
            diverging_fields: record.diverging_fields.clone(),
            strategy_applied: record.strategy_applied,
        }
    }
}

/// Payload of the `conflictsResolved` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConflictsResolved {
    pub count: usize,
    pub details: Vec<ConflictSummary>,
}

impl ConflictsResolved {
    pub fn from_records(records: &[ConflictRecord]) -> Self {
        ConflictsResolved {
            count: records.len(),
            details: records.iter().map(ConflictSummary::from).collect(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Product, StockMovement, MovementReason};
    use chrono::Duration;

    fn pair() -> (Product, Product) {
        let mut local = Product::new("COKE-330", "Coca-Cola", 1000, 10);
        local.remote_id = Some("rp-1".into());
        let mut remote = local.clone();
        remote.id = "remote-side-id".into();
        remote.price_cents = 1200;
        (local, remote)
    }

    #[test]
    fn test_default_policy() {
        let policy = ConflictPolicy::default();
        assert_eq!(policy.strategy_for(EntityTable::Products), ConflictStrategy::ServerWins);
        assert_eq!(policy.strategy_for(EntityTable::CashierOrders), ConflictStrategy::ServerWins);
        assert_eq!(policy.strategy_for(EntityTable::Sales), ConflictStrategy::LocalWins);
        assert_eq!(policy.strategy_for(EntityTable::StockMovements), ConflictStrategy::TimestampWins);

        let policy = policy.with(EntityTable::Products, ConflictStrategy::Merge);
        assert_eq!(policy.strategy_for(EntityTable::Products), ConflictStrategy::Merge);
    }

    #[test]
    fn test_server_wins_keeps_local_id() {
        let (local, remote) = pair();
        let (resolved, winner) = resolve_pair(&local, &remote, ConflictStrategy::ServerWins);
        assert_eq!(resolved.id, local.id);
        assert_eq!(resolved.price_cents, 1200);
        assert_eq!(winner, Winner::Remote);
    }

    #[test]
    fn test_local_wins_must_be_pushed() {
        let (local, remote) = pair();
        let (resolved, winner) = resolve_pair(&local, &remote, ConflictStrategy::LocalWins);
        assert_eq!(resolved.price_cents, 1000);
        assert_eq!(winner, Winner::Local);
    }

    #[test]
    fn test_timestamp_tie_falls_back_to_server() {
        let now = Utc::now();
        let mut local = StockMovement::new("p-1", -2, MovementReason::Sale);
        local.remote_id = Some("rm-1".into());
        local.updated_at = now;
        let mut remote = local.clone();
        remote.quantity_delta = -3;

        let (resolved, _) = resolve_pair(&local, &remote, ConflictStrategy::TimestampWins);
        assert_eq!(resolved.quantity_delta, -3);

        local.updated_at = now + Duration::seconds(1);
        let (resolved, winner) = resolve_pair(&local, &remote, ConflictStrategy::TimestampWins);
        assert_eq!(resolved.quantity_delta, -2);
        assert_eq!(winner, Winner::Local);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let (local, remote) = pair();
        for strategy in [
            ConflictStrategy::ServerWins,
            ConflictStrategy::LocalWins,
            ConflictStrategy::TimestampWins,
            ConflictStrategy::Merge,
        ] {
            let (first, _) = resolve_pair(&local, &remote, strategy);
            // The resolved record becomes both the local row and the new shadow.
            assert!(first.diverging_fields(&first).is_empty());
            let (second, winner) = resolve_pair(&first, &first, strategy);
            assert_eq!(second, first);
            assert_eq!(winner, Winner::Remote);
        }
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("merge".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::Merge);
        assert!("last_write".parse::<ConflictStrategy>().is_err());
    }
}
