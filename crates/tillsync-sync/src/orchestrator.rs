//! # Sync Orchestrator
//!
//! The control loop that reconciles the Local Store with the authority.
//!
//! ## Run Phases
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  trigger ──► RunGuard (single flight) ──busy──► Skipped (no-op)         │
//! │                  │                                                      │
//! │                  ▼                                                      │
//! │  1. Reachability   any endpoint answers?   no ──► outcome = failure     │
//! │  2. Pull           list_since(cursor) per table, parents first          │
//! │  3. Push           queue batches, one item at a time                    │
//! │                      create → POST    update → PUT    delete → DELETE   │
//! │  4. Conflicts      find + resolve rows flagged by the pull              │
//! │  5. Bookkeeping    append SyncRun                                       │
//! │                                                                         │
//! │  Every phase commits its own effects. Past the run budget the           │
//! │  remaining phases are skipped and the outcome is `partial`.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Triggers
//! ```text
//!   interval tick ─────────────┐
//!   ConnectivityRestored ──────┼──► spawn(run_once) ── guard coalesces bursts
//!   queue Notify (link up) ────┤
//!   OrchestratorHandle::force ─┘    (Forced bypasses suppression)
//! ```

use chrono::Utc;
use sqlx::SqliteConnection;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tillsync_core::{
    ConflictRecord, ConflictsResolved, EntityTable, QueueItem, QueueMutation, SyncOutcome, SyncRecord,
    SyncRun, SyncStatus, SyncTrigger, Winner,
};
use tillsync_db::repository::queue::open_items_for_entity_on;
use tillsync_db::repository::shadow::upsert_shadow_on;
use tillsync_db::store::{delete_row, fetch, fetch_by_remote_id, remote_id_of, set_sync_state};
use tillsync_db::{with_entity_type, Database, DbError, StoredEntity};

use crate::authority::{encode_record, RemoteAuthority};
use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::error::{SyncError, SyncResult};
use crate::mirror::apply_remote_records;
use crate::monitor::{NetworkEvent, NetworkMonitor};
use crate::queue::ChangeQueue;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const COMMAND_CHANNEL_CAPACITY: usize = 8;

// =============================================================================
// Settings & Events
// =============================================================================

/// Timing bounds of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Periodic trigger.
    pub interval: Duration,
    /// Soft bound on one run.
    pub run_budget: Duration,
    /// Bound on each pull or push call.
    pub request_timeout: Duration,
    /// Bound on the reachability test.
    pub reachability_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            interval: Duration::from_secs(300),
            run_budget: Duration::from_secs(60),
            request_timeout: Duration::from_secs(15),
            reachability_timeout: Duration::from_secs(10),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        OrchestratorSettings {
            interval: config.interval(),
            run_budget: config.run_budget(),
            request_timeout: config.authority.request_timeout(),
            reachability_timeout: config.reachability_timeout(),
        }
    }
}

/// Published on [`SyncOrchestrator::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    RunStarted(SyncTrigger),
    RunFinished(SyncRun),
    ConflictsResolved(ConflictsResolved),
    /// A trigger arrived while a run was active and was dropped.
    Skipped(SyncTrigger),
}

// =============================================================================
// Single-flight Guard
// =============================================================================

/// Held for the duration of one run. Dropping it returns the state to idle.
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { running })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// How the pull phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullEnd {
    Complete,
    /// Some table or record was not applied.
    Incomplete,
    /// A pull call found the authority gone.
    LinkLost,
}

enum PushOutcome {
    Pushed,
    Skipped,
    Deferred,
}

// =============================================================================
// Orchestrator
// =============================================================================

struct Inner {
    db: Database,
    authority: Arc<dyn RemoteAuthority>,
    monitor: Arc<NetworkMonitor>,
    queue: ChangeQueue,
    resolver: ConflictResolver,
    settings: OrchestratorSettings,
    running: AtomicBool,
    suppressed: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

/// Drives sync runs. Cheap to clone; clones share one run guard.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        db: Database,
        authority: Arc<dyn RemoteAuthority>,
        monitor: Arc<NetworkMonitor>,
        queue: ChangeQueue,
        resolver: ConflictResolver,
        settings: OrchestratorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        SyncOrchestrator {
            inner: Arc::new(Inner {
                db,
                authority,
                monitor,
                queue,
                resolver,
                settings,
                running: AtomicBool::new(false),
                suppressed: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.inner.monitor
    }

    pub fn queue(&self) -> &ChangeQueue {
        &self.inner.queue
    }

    pub fn authority(&self) -> &Arc<dyn RemoteAuthority> {
        &self.inner.authority
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// True while a run holds the guard.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Pauses (or resumes) automatic triggers. Queued work is kept and a
    /// forced sync still runs.
    pub fn set_suppressed(&self, suppressed: bool) {
        let previous = self.inner.suppressed.swap(suppressed, Ordering::AcqRel);
        if previous != suppressed {
            info!(suppressed, "Automatic sync triggers changed");
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.inner.suppressed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Executes one run.
    ///
    /// ## Returns
    /// * `Ok(Some(run))` - The recorded run, whatever its outcome
    /// * `Ok(None)` - Another run was active; this trigger was coalesced
    /// * `Err(_)` - The run record itself could not be written
    pub async fn run_once(&self, trigger: SyncTrigger) -> SyncResult<Option<SyncRun>> {
        let _guard = match RunGuard::acquire(&self.inner.running) {
            Some(guard) => guard,
            None => {
                debug!(trigger = ?trigger, "Sync already running, trigger coalesced");
                let _ = self.inner.events.send(SyncEvent::Skipped(trigger));
                return Ok(None);
            }
        };

        let mut run = SyncRun::begin(trigger);
        let deadline = Instant::now() + self.inner.settings.run_budget;
        let _ = self.inner.events.send(SyncEvent::RunStarted(trigger));
        info!(run_id = %run.id, trigger = ?trigger, "Sync run started");

        let mut errors: Vec<String> = Vec::new();
        let mut over_budget = false;
        let mut deferred = 0usize;
        let mut local_wins = 0usize;

        // 1. Reachability
        let reachability = self
            .inner
            .monitor
            .test_reachability(self.inner.settings.reachability_timeout)
            .await;

        if !reachability.reachable {
            let cause = if self.inner.monitor.is_link_up() {
                SyncError::Unreachable("no reachability endpoint answered".into())
            } else {
                SyncError::NoNetwork
            };
            errors.push(cause.to_string());
        } else {
            // 2. Pull
            let pulled = self.pull_phase(&mut run, deadline, &mut errors, &mut over_budget).await;
            run.pull_succeeded = pulled == PullEnd::Complete;

            // 3. Push
            if pulled == PullEnd::LinkLost {
                debug!("Authority lost during pull, skipping push phase");
            } else if !over_budget {
                deferred = self.push_phase(&mut run, deadline, &mut errors, &mut over_budget).await;
            }

            // 4. Conflicts
            if !over_budget {
                let records = self.conflict_phase(deadline, &mut errors, &mut over_budget, &mut local_wins).await;
                run.conflict_count = records.len() as i64;
                if !records.is_empty() {
                    let _ = self
                        .inner
                        .events
                        .send(SyncEvent::ConflictsResolved(ConflictsResolved::from_records(&records)));
                }
            }
        }

        // 5. Bookkeeping
        if over_budget {
            errors.push(format!("run exceeded its {:?} budget", self.inner.settings.run_budget));
        }
        run.completed_at = Utc::now();
        run.outcome = if errors.is_empty() {
            SyncOutcome::Success
        } else if over_budget {
            SyncOutcome::Partial
        } else if !reachability.reachable
            || (!run.pull_succeeded
                && run.pulled_count == 0
                && run.pushed_count == 0
                && run.conflict_count == 0)
        {
            SyncOutcome::Failure
        } else {
            SyncOutcome::Partial
        };
        run.error = if errors.is_empty() { None } else { Some(errors.join("; ")) };

        self.inner.db.sync_runs().record(&run).await?;

        info!(
            run_id = %run.id,
            outcome = ?run.outcome,
            pulled = run.pulled_count,
            pushed = run.pushed_count,
            conflicts = run.conflict_count,
            "Sync run finished"
        );
        let _ = self.inner.events.send(SyncEvent::RunFinished(run.clone()));

        // Work that arrived (or was unblocked) during the run gets its own.
        let fresh = match self.inner.queue.fresh_pending_since(run.started_at).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(error = %e, "Failed to count fresh queue items");
                0
            }
        };
        if fresh > 0 || (deferred > 0 && (run.pushed_count > 0 || local_wins > 0)) {
            self.inner.queue.notify_pending();
        }
        self.inner.queue.publish_stats().await;

        Ok(Some(run))
    }

    /// Bounds a network call by the request timeout.
    async fn call<T, F>(&self, operation: &str, call: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        let limit = self.inner.settings.request_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                operation: operation.to_string(),
                secs: limit.as_secs(),
            }),
        }
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Pulls every table changed since the last complete pull.
    ///
    /// Only a [`PullEnd::Complete`] pull moves the cursor, so records that
    /// were skipped are fetched again next run.
    async fn pull_phase(
        &self,
        run: &mut SyncRun,
        deadline: Instant,
        errors: &mut Vec<String>,
        over_budget: &mut bool,
    ) -> PullEnd {
        let cursor = match self.inner.db.sync_runs().last_pull_cursor().await {
            Ok(cursor) => cursor,
            Err(e) => {
                errors.push(format!("pull cursor: {}", e));
                return PullEnd::Incomplete;
            }
        };

        let mut end = PullEnd::Complete;
        for table in EntityTable::ALL {
            if Instant::now() >= deadline {
                *over_budget = true;
                return PullEnd::Incomplete;
            }

            let records = match self.call("pull", self.inner.authority.list_since(table, cursor)).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(entity_table = %table, error = %e, "Pull failed");
                    errors.push(format!("pull {}: {}", table, e));
                    if e.is_connectivity() || matches!(e, SyncError::Timeout { .. }) {
                        return PullEnd::LinkLost;
                    }
                    end = PullEnd::Incomplete;
                    continue;
                }
            };

            match apply_remote_records(&self.inner.db, table, &records).await {
                Ok(outcome) => {
                    run.pulled_count += (outcome.applied + outcome.removed) as i64;
                    if outcome.skipped > 0 {
                        errors.push(format!("pull {}: {} records skipped", table, outcome.skipped));
                        end = PullEnd::Incomplete;
                    }
                    if !records.is_empty() {
                        debug!(
                            entity_table = %table,
                            applied = outcome.applied,
                            removed = outcome.removed,
                            skipped = outcome.skipped,
                            diverged = outcome.diverged.len(),
                            "Applied pulled records"
                        );
                    }
                }
                Err(e) => {
                    error!(entity_table = %table, error = %e, "Failed to apply pulled records");
                    errors.push(format!("apply {}: {}", table, e));
                    end = PullEnd::Incomplete;
                }
            }
        }
        end
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Drains items due at the run's start, one at a time.
    ///
    /// ## Returns
    /// The number of items deferred behind an unpushed parent or an open
    /// conflict.
    async fn push_phase(
        &self,
        run: &mut SyncRun,
        deadline: Instant,
        errors: &mut Vec<String>,
        over_budget: &mut bool,
    ) -> usize {
        let mut deferred = 0;
        let mut attempted = std::collections::HashSet::new();

        'batches: loop {
            if Instant::now() >= deadline {
                *over_budget = true;
                break;
            }

            let batch = match self.inner.queue.dequeue_due(run.started_at).await {
                Ok(batch) => batch,
                Err(e) => {
                    errors.push(format!("dequeue: {}", e));
                    break;
                }
            };
            if batch.iter().all(|item| attempted.contains(&item.id)) {
                break;
            }

            for item in batch {
                if !attempted.insert(item.id.clone()) {
                    continue;
                }
                if Instant::now() >= deadline {
                    *over_budget = true;
                    break 'batches;
                }

                match self.push_item(&item).await {
                    Ok(PushOutcome::Pushed) => run.pushed_count += 1,
                    Ok(PushOutcome::Skipped) => {}
                    Ok(PushOutcome::Deferred) => deferred += 1,
                    Err(e) => {
                        errors.push(format!("push {} {}: {}", item.entity_table, item.entity_local_id, e));
                        if e.is_connectivity() || matches!(e, SyncError::Timeout { .. }) {
                            warn!(error = %e, "Authority gone, stopping push phase");
                            break 'batches;
                        }
                    }
                }
            }
        }
        deferred
    }

    /// Pushes one item and applies the queue transition for its result.
    async fn push_item(&self, item: &QueueItem) -> SyncResult<PushOutcome> {
        if !self.inner.queue.mark_processing(&item.id).await? {
            return Ok(PushOutcome::Skipped);
        }

        let result = match &item.payload {
            QueueMutation::Delete {
                entity_table,
                remote_id,
                ..
            } => self.push_delete(item, *entity_table, remote_id).await,
            QueueMutation::Create { .. } | QueueMutation::Update { .. } => {
                with_entity_type!(item.entity_table, E => self.push_record::<E>(item).await)
            }
        };

        let error = match result {
            Ok(outcome) => return Ok(outcome),
            Err(error) => error,
        };

        match &error {
            SyncError::DependencyPending { .. } => {
                self.inner.queue.defer(&item.id, Utc::now(), &error.to_string()).await?;
                return Ok(PushOutcome::Deferred);
            }
            e if e.is_terminal() || matches!(e, SyncError::SerializationFailed(_) | SyncError::Domain(_)) => {
                self.inner.queue.mark_rejected(&item.id, &error.to_string()).await?;
                self.mark_row_failed(item).await;
            }
            _ => {
                let after = self.inner.queue.mark_failed(&item.id, &error.to_string()).await?;
                if after.is_terminal() {
                    self.mark_row_failed(item).await;
                }
            }
        }
        Err(error)
    }

    async fn push_delete(&self, item: &QueueItem, table: EntityTable, remote_id: &str) -> SyncResult<PushOutcome> {
        self.call("push", self.inner.authority.delete(table, remote_id)).await?;
        self.inner.db.shadows().delete(table, remote_id).await?;
        self.inner.queue.mark_completed(&item.id).await?;

        debug!(queue_item = %item.id, entity_table = %table, remote_id, "Pushed delete");
        Ok(PushOutcome::Pushed)
    }

    /// Pushes a create or update.
    ///
    /// A row that already holds a remote identifier is always sent as an
    /// update, so a create that reached the authority before a crash is not
    /// repeated.
    async fn push_record<E: StoredEntity>(&self, item: &QueueItem) -> SyncResult<PushOutcome> {
        let local_id = item.entity_local_id.clone();
        let snapshot = match item.payload.snapshot() {
            Some(snapshot) => snapshot.clone(),
            None => return Err(SyncError::SerializationFailed(format!("queue item {} has no snapshot", item.id))),
        };
        let mut outgoing = E::from_snapshot(snapshot.clone())?;

        let remote_id = {
            let mut conn = self.inner.db.pool().acquire().await.map_err(DbError::from)?;
            let row: E = match fetch(&mut *conn, &local_id).await? {
                Some(row) => row,
                None => {
                    drop(conn);
                    debug!(queue_item = %item.id, "Row gone before push, completing item");
                    self.inner.queue.mark_completed(&item.id).await?;
                    return Ok(PushOutcome::Skipped);
                }
            };

            if row.sync_status() == SyncStatus::Conflict {
                drop(conn);
                self.inner
                    .queue
                    .defer(&item.id, Utc::now(), "awaiting conflict resolution")
                    .await?;
                return Ok(PushOutcome::Deferred);
            }

            for (parent, key) in outgoing.foreign_keys_mut() {
                match remote_id_of(&mut *conn, parent, key.as_str()).await? {
                    Some(remote) => *key = remote,
                    None => {
                        return Err(SyncError::DependencyPending {
                            table: E::TABLE,
                            local_id: local_id.clone(),
                        })
                    }
                }
            }
            row.remote_id().map(str::to_string)
        };

        let body = encode_record(&outgoing)?;
        let accepted = match &remote_id {
            Some(remote_id) => {
                self.call("push", self.inner.authority.update(E::TABLE, remote_id, &body))
                    .await?
            }
            None => {
                self.call("push", self.inner.authority.create(E::TABLE, &item.id, &body))
                    .await?
            }
        };

        let mut shadow = E::from_snapshot(snapshot)?;
        shadow.set_id(local_id.clone());
        shadow.set_remote_id(Some(accepted.remote_id.clone()));
        shadow.set_updated_at(accepted.updated_at);
        shadow.set_sync_status(SyncStatus::Synced);

        let item_id = item.id.clone();
        let acknowledged = accepted.remote_id.clone();
        self.inner
            .db
            .transaction(move |conn: &mut SqliteConnection| {
                Box::pin(async move {
                    // A pull may have mirrored this record under another local id
                    // after a create whose response never arrived.
                    if let Some(mirror) = fetch_by_remote_id::<E>(&mut *conn, &acknowledged).await? {
                        if mirror.id() != local_id {
                            match delete_row(&mut *conn, E::TABLE, mirror.id()).await {
                                Ok(_) => debug!(entity_table = %E::TABLE, mirror = %mirror.id(), "Dropped duplicate mirror"),
                                Err(DbError::ForeignKeyViolation { .. }) => {
                                    warn!(entity_table = %E::TABLE, mirror = %mirror.id(), "Duplicate mirror has dependents")
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    }

                    let open = open_items_for_entity_on(&mut *conn, E::TABLE, &local_id, Some(&item_id)).await?;
                    let status = if open > 0 {
                        SyncStatus::Pending
                    } else {
                        SyncStatus::Synced
                    };
                    set_sync_state(&mut *conn, E::TABLE, &local_id, Some(&acknowledged), status).await?;
                    upsert_shadow_on(&mut *conn, &acknowledged, &shadow.into_snapshot()).await?;
                    Ok(())
                })
            })
            .await?;

        self.inner.queue.mark_completed(&item.id).await?;
        debug!(
            queue_item = %item.id,
            entity_table = %E::TABLE,
            remote_id = %accepted.remote_id,
            operation = item.operation.as_str(),
            "Pushed record"
        );
        Ok(PushOutcome::Pushed)
    }

    /// Flags the row of a dead-lettered item for manual review.
    async fn mark_row_failed(&self, item: &QueueItem) {
        let table = item.entity_table;
        let local_id = item.entity_local_id.clone();
        let result = self
            .inner
            .db
            .transaction(move |conn: &mut SqliteConnection| {
                Box::pin(async move { set_sync_state(&mut *conn, table, &local_id, None, SyncStatus::Failed).await })
            })
            .await;

        if let Err(e) = result {
            warn!(queue_item = %item.id, error = %e, "Failed to flag row as failed");
        }
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    async fn conflict_phase(
        &self,
        deadline: Instant,
        errors: &mut Vec<String>,
        over_budget: &mut bool,
        local_wins: &mut usize,
    ) -> Vec<ConflictRecord> {
        let resolver = &self.inner.resolver;
        resolver.begin_cycle();

        let conflicts = match resolver.find_conflicts().await {
            Ok(conflicts) => conflicts,
            Err(e) => {
                errors.push(format!("find conflicts: {}", e));
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for conflict in conflicts {
            if Instant::now() >= deadline {
                *over_budget = true;
                break;
            }
            match resolver.resolve(&conflict).await {
                Ok(Some(resolution)) => {
                    if resolution.winner == Winner::Local {
                        *local_wins += 1;
                    }
                    records.push(resolution.record);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(entity_table = %conflict.entity_table, remote_id = %conflict.remote_id, error = %e, "Conflict resolution failed");
                    errors.push(format!("resolve {} {}: {}", conflict.entity_table, conflict.remote_id, e));
                }
            }
        }
        records
    }

    // =========================================================================
    // Background Loop
    // =========================================================================

    /// Starts the trigger loop.
    ///
    /// Each trigger runs in its own task so that bursts arriving mid-run hit
    /// the guard and are coalesced instead of queueing up behind it.
    pub fn spawn(&self) -> OrchestratorHandle {
        let (command_tx, mut command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let orchestrator = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.inner.settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            let mut network = orchestrator.inner.monitor.subscribe();
            let pending = orchestrator.inner.queue.pending_signal();
            info!(
                interval_secs = orchestrator.inner.settings.interval.as_secs(),
                "Sync orchestrator started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => orchestrator.trigger(SyncTrigger::Periodic),

                    event = network.recv() => match event {
                        Ok(NetworkEvent::ConnectivityRestored) => {
                            orchestrator.trigger(SyncTrigger::ConnectivityRestored)
                        }
                        Ok(NetworkEvent::LinkChanged { .. }) => {}
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Network events lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },

                    _ = pending.notified() => {
                        if orchestrator.inner.monitor.is_link_up() {
                            orchestrator.trigger(SyncTrigger::QueuePending);
                        } else {
                            debug!("Queue has work, waiting for the link");
                        }
                    }

                    command = command_rx.recv() => match command {
                        Some(Command::Sync { reply }) => {
                            let forced = orchestrator.clone();
                            tokio::spawn(async move {
                                let _ = reply.send(forced.run_once(SyncTrigger::Forced).await);
                            });
                        }
                        Some(Command::Shutdown) | None => break,
                    },
                }
            }

            info!("Sync orchestrator stopped");
        });

        OrchestratorHandle { command_tx, task }
    }

    fn trigger(&self, trigger: SyncTrigger) {
        if self.is_suppressed() {
            debug!(trigger = ?trigger, "Trigger suppressed");
            return;
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run_once(trigger).await {
                error!(trigger = ?trigger, error = %e, "Sync run failed");
            }
        });
    }
}

// =============================================================================
// Handle
// =============================================================================

enum Command {
    Sync {
        reply: oneshot::Sender<SyncResult<Option<SyncRun>>>,
    },
    Shutdown,
}

/// Controls a spawned trigger loop.
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Runs a sync now, regardless of suppression.
    pub async fn force_sync(&self) -> SyncResult<Option<SyncRun>> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(Command::Sync { reply })
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        response
            .await
            .map_err(|e| SyncError::ChannelError(e.to_string()))?
    }

    /// Stops the loop. A run already in progress finishes on its own.
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Orchestrator task ended abnormally");
        }
    }
}
