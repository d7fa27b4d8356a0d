//! Shared fixtures for the sync engine's integration tests: an in-process
//! authority with scriptable failures and a switchable reachability prober.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tillsync_core::{ConflictPolicy, EntityTable, SyncRecord};
use tillsync_db::{Database, DbConfig};
use tillsync_sync::{
    encode_record, ChangeQueue, ConflictResolver, NetworkMonitor, OrchestratorSettings, Prober,
    RemoteAuthority, RemoteRecord, SyncError, SyncFacade, SyncOrchestrator, SyncResult,
};

// =============================================================================
// Scripted Authority
// =============================================================================

/// One push the authority received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCall {
    pub verb: &'static str,
    pub table: EntityTable,
    pub remote_id: Option<String>,
}

#[derive(Default)]
struct AuthorityState {
    collections: HashMap<EntityTable, BTreeMap<String, RemoteRecord>>,
    idempotency: HashMap<String, (EntityTable, String)>,
    next_id: u64,
    pushes: Vec<PushCall>,
    /// Pushes that fail as unreachable before anything is stored.
    unreachable_pushes: u32,
    /// Creates that are stored but whose response is lost.
    lost_responses: u32,
}

/// Keeps collections in memory and honors idempotency keys.
#[derive(Default)]
pub struct ScriptedAuthority {
    state: Mutex<AuthorityState>,
    list_delay: Duration,
}

impl ScriptedAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `list_since` call sleeps for `delay` first.
    pub fn with_list_delay(delay: Duration) -> Self {
        ScriptedAuthority {
            list_delay: delay,
            ..Default::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AuthorityState> {
        self.state.lock().unwrap()
    }

    /// Stores `record` upstream under `remote_id`.
    pub fn seed<E: SyncRecord>(&self, remote_id: &str, record: &E) {
        let stored = RemoteRecord {
            remote_id: remote_id.to_string(),
            updated_at: Utc::now(),
            deleted: false,
            fields: encode_record(record).unwrap(),
        };
        self.state()
            .collections
            .entry(E::TABLE)
            .or_default()
            .insert(remote_id.to_string(), stored);
    }

    /// Changes one field upstream and bumps the record's timestamp.
    pub fn set_field(&self, table: EntityTable, remote_id: &str, field: &str, value: Value) {
        let mut state = self.state();
        let record = state
            .collections
            .get_mut(&table)
            .and_then(|c| c.get_mut(remote_id))
            .unwrap();
        record.fields.insert(field.to_string(), value);
        record.updated_at = Utc::now();
    }

    pub fn get(&self, table: EntityTable, remote_id: &str) -> Option<RemoteRecord> {
        self.state()
            .collections
            .get(&table)
            .and_then(|c| c.get(remote_id))
            .cloned()
    }

    pub fn records(&self, table: EntityTable) -> Vec<RemoteRecord> {
        self.state()
            .collections
            .get(&table)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pushes(&self) -> Vec<PushCall> {
        self.state().pushes.clone()
    }

    pub fn fail_pushes_unreachable(&self, count: u32) {
        self.state().unreachable_pushes = count;
    }

    pub fn lose_create_responses(&self, count: u32) {
        self.state().lost_responses = count;
    }

    fn push_gate(state: &mut AuthorityState) -> SyncResult<()> {
        if state.unreachable_pushes > 0 {
            state.unreachable_pushes -= 1;
            return Err(SyncError::Unreachable("503: upstream unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteAuthority for ScriptedAuthority {
    async fn list_since(
        &self,
        table: EntityTable,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<RemoteRecord>> {
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        Ok(self
            .records(table)
            .into_iter()
            .filter(|r| since.map_or(true, |since| r.updated_at >= since))
            .collect())
    }

    async fn create(
        &self,
        table: EntityTable,
        idempotency_key: &str,
        body: &Map<String, Value>,
    ) -> SyncResult<RemoteRecord> {
        let mut state = self.state();
        Self::push_gate(&mut state)?;
        state.pushes.push(PushCall {
            verb: "create",
            table,
            remote_id: None,
        });

        if let Some((table, remote_id)) = state.idempotency.get(idempotency_key).cloned() {
            if let Some(existing) = state.collections.get(&table).and_then(|c| c.get(&remote_id)) {
                return Ok(existing.clone());
            }
        }

        state.next_id += 1;
        let remote_id = format!("r-{}-{}", table.collection(), state.next_id);
        let record = RemoteRecord {
            remote_id: remote_id.clone(),
            updated_at: Utc::now(),
            deleted: false,
            fields: body.clone(),
        };
        state
            .collections
            .entry(table)
            .or_default()
            .insert(remote_id.clone(), record.clone());
        state
            .idempotency
            .insert(idempotency_key.to_string(), (table, remote_id));

        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(SyncError::Timeout {
                operation: "push".into(),
                secs: 15,
            });
        }
        Ok(record)
    }

    async fn update(
        &self,
        table: EntityTable,
        remote_id: &str,
        body: &Map<String, Value>,
    ) -> SyncResult<RemoteRecord> {
        let mut state = self.state();
        Self::push_gate(&mut state)?;
        state.pushes.push(PushCall {
            verb: "update",
            table,
            remote_id: Some(remote_id.to_string()),
        });

        let record = state
            .collections
            .get_mut(&table)
            .and_then(|c| c.get_mut(remote_id))
            .ok_or_else(|| SyncError::from_status(404, format!("{} not found", remote_id)))?;
        record.fields = body.clone();
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, table: EntityTable, remote_id: &str) -> SyncResult<()> {
        let mut state = self.state();
        Self::push_gate(&mut state)?;
        state.pushes.push(PushCall {
            verb: "delete",
            table,
            remote_id: Some(remote_id.to_string()),
        });
        if let Some(collection) = state.collections.get_mut(&table) {
            collection.remove(remote_id);
        }
        Ok(())
    }
}

// =============================================================================
// Prober
// =============================================================================

/// Answers every probe with the current value of a shared flag.
#[derive(Clone, Default)]
pub struct SwitchProber(pub Arc<AtomicBool>);

#[async_trait]
impl Prober for SwitchProber {
    async fn probe(&self, _endpoint: &str) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A fully wired engine over one database and one scripted authority.
pub struct Harness {
    pub db: Database,
    pub authority: Arc<ScriptedAuthority>,
    pub monitor: Arc<NetworkMonitor>,
    pub reachable: Arc<AtomicBool>,
    pub orchestrator: SyncOrchestrator,
    pub facade: SyncFacade,
}

impl Harness {
    pub async fn in_memory() -> Self {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        Self::build(db, ScriptedAuthority::new(), ConflictPolicy::default(), Self::settings())
    }

    /// Bounds loose enough that no test run hits them.
    pub fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            run_budget: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            reachability_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    pub fn build(
        db: Database,
        authority: ScriptedAuthority,
        policy: ConflictPolicy,
        settings: OrchestratorSettings,
    ) -> Self {
        let reachable = Arc::new(AtomicBool::new(false));
        let monitor = Arc::new(NetworkMonitor::new(
            Arc::new(SwitchProber(Arc::clone(&reachable))),
            vec!["http://authority.test/health".into()],
            false,
        ));
        let authority = Arc::new(authority);
        let queue = ChangeQueue::new(&db, 25);
        let resolver = ConflictResolver::new(db.clone(), policy);
        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            authority.clone(),
            Arc::clone(&monitor),
            queue,
            resolver,
            settings,
        );
        let facade = SyncFacade::new(orchestrator.clone());

        Harness {
            db,
            authority,
            monitor,
            reachable,
            orchestrator,
            facade,
        }
    }

    pub fn go_online(&self) {
        self.reachable.store(true, Ordering::SeqCst);
        self.monitor.report_link(true);
    }

    pub fn go_offline(&self) {
        self.reachable.store(false, Ordering::SeqCst);
        self.monitor.report_link(false);
    }

    /// Makes every item due now, skipping its backoff.
    pub async fn skip_backoff(&self) {
        sqlx::query("UPDATE queue_items SET next_attempt_at = 0 WHERE status = 'pending'")
            .execute(self.db.pool())
            .await
            .unwrap();
    }
}

/// Polls `check` every 20ms until it holds or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
