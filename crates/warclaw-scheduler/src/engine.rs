//! Scheduler engine: selects and runs the next unit of work.
//!
//! One `tick()` runs at most one unit: the earliest-due eligible scheduled
//! record or pending manual task. Driver failures are outcomes: every run
//! releases the session, feeds the lockout registry and either reschedules
//! its record or finalizes its manual task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use warclaw_core::config::SchedulerConfig;
use warclaw_core::traits::{CredentialProvider, PageDriver, SettingsStore, WorldRegistry};
use warclaw_core::{
    DriverOutcome, ExecutionContext, Result, TaskKind, WarClawError, World, WorldId,
};

use crate::executors::DriverSet;
use crate::history::RunRecord;
use crate::lockout::{LockoutRecord, LockoutTransition};
use crate::manual::{EnqueueReceipt, ManualTask};
use crate::next_run::NextRunRecord;
use crate::persistence::SchedulerDb;
use crate::session::SessionStatus;
use crate::state::{Candidate, OrchestratorState, SessionGuard, SharedState, lock_state};

/// Result of one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub world_id: WorldId,
    pub kind: TaskKind,
    pub manual: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub outcome: DriverOutcome,
    pub lockout: LockoutTransition,
    /// New due time for scheduled runs that remain enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_due: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// The session was held by someone else.
    Busy,
    /// Nothing eligible.
    Idle,
    Ran(Box<RunReport>),
}

/// Answer to an immediate trigger.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DriverOutcome>,
}

impl TriggerResult {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            outcome: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "change", content = "due_at", rename_all = "snake_case")]
pub enum ScheduleChange {
    Added(DateTime<Utc>),
    Removed,
    Unchanged,
}

/// Read-only snapshot for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub session: Option<SessionStatus>,
    pub lockouts: Vec<LockoutRecord>,
    pub upcoming: Vec<NextRunRecord>,
    pub scheduled_records: usize,
    pub pending_manual: usize,
    pub drivers: Vec<TaskKind>,
    pub recent_runs: Vec<RunRecord>,
}

struct RunResult {
    outcome: DriverOutcome,
    /// False when the run never touched the site.
    reached_site: bool,
    /// Missing driver or credentials: the run never started.
    configuration_error: bool,
    started_at: DateTime<Utc>,
}

pub struct SchedulerEngine {
    state: SharedState,
    registry: Arc<dyn WorldRegistry>,
    settings: Arc<dyn SettingsStore>,
    credentials: Arc<dyn CredentialProvider>,
    drivers: DriverSet,
    db: Option<Arc<SchedulerDb>>,
    config: SchedulerConfig,
    wake: Arc<Notify>,
}

impl SchedulerEngine {
    pub fn new(
        registry: Arc<dyn WorldRegistry>,
        settings: Arc<dyn SettingsStore>,
        credentials: Arc<dyn CredentialProvider>,
        drivers: DriverSet,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            state: SharedState::default(),
            registry,
            settings,
            credentials,
            drivers,
            db: None,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Attach persistence and reload manual tasks. Tasks a restart caught
    /// mid-run are finalized as failed.
    pub fn with_db(mut self, db: Arc<SchedulerDb>) -> Result<Self> {
        let tasks = db.load_manual_tasks()?;
        let loaded = tasks.len();
        let interrupted = lock_state(&self.state).manual.restore(tasks, Utc::now());
        for task in &interrupted {
            db.save_manual_task(task)?;
        }
        if loaded > 0 {
            tracing::info!(
                "📂 Restored {} manual task(s), {} interrupted by restart",
                loaded,
                interrupted.len()
            );
        }
        self.db = Some(db);
        Ok(self)
    }

    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Force a scheduler pass now.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn persist_task(&self, task: &ManualTask) {
        if let Some(db) = &self.db
            && let Err(e) = db.save_manual_task(task)
        {
            tracing::warn!("⚠️ Failed to persist manual task {}: {e}", task.id);
        }
    }

    fn evict_finished(&self, now: DateTime<Utc>) {
        let evicted = lock_state(&self.state).manual.evict(
            now,
            self.config.manual_task_ttl_secs,
            self.config.manual_task_max_retained,
        );
        if !evicted.is_empty()
            && let Some(db) = &self.db
            && let Err(e) = db.delete_manual_tasks(&evicted)
        {
            tracing::warn!("⚠️ Failed to delete evicted manual tasks: {e}");
        }
    }

    async fn worlds_by_id(&self) -> Result<HashMap<WorldId, World>> {
        Ok(self
            .registry
            .list_worlds()
            .await?
            .into_iter()
            .map(|w| (w.id, w))
            .collect())
    }

    /// Run at most one unit of work.
    pub async fn tick(&self) -> TickOutcome {
        let now = Utc::now();
        self.evict_finished(now);
        if lock_state(&self.state).session.is_held() {
            return TickOutcome::Busy;
        }

        let worlds = match self.worlds_by_id().await {
            Ok(worlds) => worlds,
            Err(e) => {
                tracing::warn!("⚠️ World registry unavailable: {e}");
                return TickOutcome::Idle;
            }
        };

        let Some((guard, claim)) = SessionGuard::claim_next(&self.state, &worlds, now) else {
            return if lock_state(&self.state).session.is_held() {
                TickOutcome::Busy
            } else {
                TickOutcome::Idle
            };
        };

        let candidate = claim.candidate;
        let payload = match &claim.manual_task {
            Some(task) => {
                self.persist_task(task);
                task.payload.clone()
            }
            None => serde_json::Value::Null,
        };
        tracing::info!(
            "▶️ Running {} for world {}{}",
            candidate.kind(),
            candidate.world_id(),
            if candidate.is_manual() { " (manual)" } else { "" }
        );

        let run = self
            .execute(
                worlds.get(&candidate.world_id()),
                candidate.world_id(),
                candidate.kind(),
                payload,
                candidate.is_manual(),
            )
            .await;
        TickOutcome::Ran(Box::new(self.complete(guard, &candidate, run).await))
    }

    async fn prepare(
        &self,
        world: Option<&World>,
        world_id: WorldId,
        kind: TaskKind,
        payload: serde_json::Value,
        manual: bool,
    ) -> Result<(Arc<dyn PageDriver>, World, ExecutionContext)> {
        let world = world
            .cloned()
            .ok_or_else(|| WarClawError::NotFound(format!("world {world_id}")))?;
        let driver = self
            .drivers
            .get(kind)
            .ok_or_else(|| WarClawError::Config(format!("No driver registered for {kind}")))?;
        let credentials = self.credentials.credentials_for(&world).await?;
        let ctx = ExecutionContext {
            credentials,
            payload,
            manual,
            timeout: Duration::from_secs(self.config.step_timeout_secs),
        };
        Ok((driver, world, ctx))
    }

    /// Invoke the driver under the run timeout. Never fails.
    async fn execute(
        &self,
        world: Option<&World>,
        world_id: WorldId,
        kind: TaskKind,
        payload: serde_json::Value,
        manual: bool,
    ) -> RunResult {
        let started_at = Utc::now();
        let (driver, world, ctx) = match self.prepare(world, world_id, kind, payload, manual).await {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!("⚠️ {} for world {} could not start: {}", kind, world_id, e);
                return RunResult {
                    outcome: DriverOutcome::from_error(&e),
                    reached_site: false,
                    configuration_error: e.is_configuration(),
                    started_at,
                };
            }
        };

        let run_timeout = self.config.run_timeout_secs;
        let mut handle = tokio::spawn(async move { driver.execute(&world, &ctx).await });
        let (outcome, reached_site) =
            match tokio::time::timeout(Duration::from_secs(run_timeout), &mut handle).await {
                Ok(Ok(outcome)) => (outcome, true),
                Ok(Err(e)) => {
                    tracing::warn!("⚠️ {} driver for world {} crashed: {}", kind, world_id, e);
                    (DriverOutcome::failed(format!("Driver crashed: {e}")), false)
                }
                Err(_) => {
                    handle.abort();
                    tracing::warn!("⏱️ {} for world {} exceeded {}s", kind, world_id, run_timeout);
                    (DriverOutcome::from_error(&WarClawError::Timeout(run_timeout)), false)
                }
            };
        RunResult {
            outcome,
            reached_site,
            configuration_error: false,
            started_at,
        }
    }

    /// Bookkeeping after a selected run, then release the session.
    async fn complete(&self, guard: SessionGuard, candidate: &Candidate, run: RunResult) -> RunReport {
        let world_id = candidate.world_id();
        let kind = candidate.kind();
        // Settings may have changed while the driver ran.
        let fresh = match self.registry.get_world(world_id).await {
            Ok(world) => world,
            Err(e) => {
                tracing::warn!("⚠️ Could not re-read world {}: {e}", world_id);
                None
            }
        };
        let defaults = self.settings.default_intervals();
        let bounds = fresh
            .as_ref()
            .filter(|w| w.schedulable(kind))
            .and_then(|w| w.interval_for(kind, &defaults));
        let finished_at = Utc::now();

        let (lockout, next_due, finished_task) = guard.finish(|st| {
            let lockout = st.lockouts.apply(
                world_id,
                kind,
                run.outcome.bot_protection_detected,
                run.reached_site,
                run.outcome.error.as_deref(),
                finished_at,
            );

            let mut next_due = None;
            let mut finished_task = None;
            match candidate {
                Candidate::Scheduled { .. } => match bounds {
                    Some(bounds) if st.next_runs.contains(world_id, kind) => {
                        let mut rng = rand::thread_rng();
                        next_due = Some(st.next_runs.reschedule_after_run(
                            world_id,
                            kind,
                            bounds,
                            finished_at,
                            &mut rng,
                        ));
                    }
                    _ => {
                        st.next_runs.remove(world_id, kind);
                    }
                },
                Candidate::Manual { task_id, .. } => {
                    match st.manual.finish(task_id, &run.outcome, finished_at) {
                        Ok(task) => finished_task = Some(task),
                        Err(e) => tracing::warn!("⚠️ Manual task {} not finalized: {e}", task_id),
                    }
                }
            }

            st.history.record(RunRecord {
                world_id,
                kind,
                manual: candidate.is_manual(),
                task_id: candidate.task_id().map(str::to_string),
                started_at: run.started_at,
                finished_at,
                success: run.outcome.success,
                bot_protection: run.outcome.bot_protection_detected,
                configuration_error: run.configuration_error,
                error: run.outcome.error.clone(),
            });
            (lockout, next_due, finished_task)
        });

        if let Some(task) = &finished_task {
            self.persist_task(task);
        }
        log_outcome(world_id, kind, &run.outcome, next_due);

        RunReport {
            world_id,
            kind,
            manual: candidate.is_manual(),
            task_id: candidate.task_id().map(str::to_string),
            outcome: run.outcome,
            lockout,
            next_due,
            started_at: run.started_at,
            finished_at,
        }
    }

    /// Run one task for one world right now, bypassing the lockout check.
    /// The recurring schedule is left untouched.
    pub async fn trigger_now(
        &self,
        world_id: WorldId,
        kind: TaskKind,
        payload: serde_json::Value,
    ) -> TriggerResult {
        let world = match self.registry.get_world(world_id).await {
            Ok(Some(world)) => world,
            Ok(None) => return TriggerResult::rejected(format!("World {world_id} not found")),
            Err(e) => return TriggerResult::rejected(format!("World registry unavailable: {e}")),
        };

        let guard = match SessionGuard::try_begin(&self.state, world_id, kind, Utc::now()) {
            Ok(guard) => guard,
            Err(holder) => {
                let message = match holder {
                    Some(h) => format!(
                        "Session busy: {} for world {} running for {}s",
                        h.kind, h.world_id, h.duration_secs
                    ),
                    None => "Session busy".to_string(),
                };
                return TriggerResult::rejected(message);
            }
        };

        if lock_state(&self.state).lockouts.is_locked(world_id) {
            tracing::info!("🔓 Manual {} for locked-out world {}", kind, world.code);
        }
        tracing::info!("▶️ Triggered {} for world {} (manual)", kind, world.code);

        let run = self
            .execute(Some(&world), world_id, kind, payload, true)
            .await;
        let finished_at = Utc::now();
        let lockout = guard.finish(|st| {
            let transition = st.lockouts.apply(
                world_id,
                kind,
                run.outcome.bot_protection_detected,
                run.reached_site,
                run.outcome.error.as_deref(),
                finished_at,
            );
            st.history.record(RunRecord {
                world_id,
                kind,
                manual: true,
                task_id: None,
                started_at: run.started_at,
                finished_at,
                success: run.outcome.success,
                bot_protection: run.outcome.bot_protection_detected,
                configuration_error: run.configuration_error,
                error: run.outcome.error.clone(),
            });
            transition
        });
        log_outcome(world_id, kind, &run.outcome, None);

        let mut message = if run.outcome.success {
            format!("{} completed for {}", kind, world.code)
        } else {
            run.outcome
                .error
                .clone()
                .unwrap_or_else(|| format!("{} failed for {}", kind, world.code))
        };
        if lockout == LockoutTransition::Cleared {
            message.push_str(" (lockout cleared)");
        }
        TriggerResult {
            success: run.outcome.success,
            message,
            outcome: Some(run.outcome),
        }
    }

    /// Apply one world's current toggles to the schedule.
    fn apply_world_state(&self, world_id: WorldId, world: Option<&World>) -> Vec<(TaskKind, ScheduleChange)> {
        let now = Utc::now();
        let mut st = lock_state(&self.state);
        let mut rng = rand::thread_rng();
        TaskKind::ALL
            .iter()
            .map(|&kind| {
                let change = match world {
                    Some(w) if w.schedulable(kind) => match st.next_runs.schedule_first_run(
                        world_id,
                        kind,
                        now,
                        self.config.first_run_delay_secs,
                        &mut rng,
                    ) {
                        Some(due) => ScheduleChange::Added(due),
                        None => ScheduleChange::Unchanged,
                    },
                    _ if st.next_runs.remove(world_id, kind) => ScheduleChange::Removed,
                    _ => ScheduleChange::Unchanged,
                };
                (kind, change)
            })
            .collect()
    }

    /// Recompute one world's records right after a settings change:
    /// enabled ⇒ near-term first run, disabled ⇒ record deleted.
    pub async fn update_world_task_states(&self, world_id: WorldId) -> Result<Vec<(TaskKind, ScheduleChange)>> {
        let world = self.registry.get_world(world_id).await?;
        let changes = self.apply_world_state(world_id, world.as_ref());
        for (kind, change) in &changes {
            match change {
                ScheduleChange::Added(due) => {
                    tracing::info!("📅 World {} {} scheduled, first run at {}", world_id, kind, due)
                }
                ScheduleChange::Removed => tracing::info!("📅 World {} {} unscheduled", world_id, kind),
                ScheduleChange::Unchanged => {}
            }
        }
        Ok(changes)
    }

    /// Startup: schedule every enabled pair, drop worlds that are gone.
    pub async fn rebuild_from_settings(&self) -> Result<usize> {
        let worlds = self.registry.list_worlds().await?;
        let ids: HashSet<WorldId> = worlds.iter().map(|w| w.id).collect();
        let dropped = lock_state(&self.state)
            .next_runs
            .retain_worlds(|id| ids.contains(&id));

        for world in &worlds {
            self.apply_world_state(world.id, Some(world));
        }
        let total = lock_state(&self.state).next_runs.len();
        tracing::info!(
            "📅 Schedule rebuilt: {} world(s), {} record(s), {} dropped",
            worlds.len(),
            total,
            dropped
        );
        Ok(total)
    }

    /// The next `n` due records. Pure read.
    pub fn upcoming_schedule(&self, n: usize) -> Vec<NextRunRecord> {
        lock_state(&self.state).next_runs.upcoming(n)
    }

    /// Queue an ad-hoc task for a known world.
    pub async fn enqueue_manual(
        &self,
        kind: TaskKind,
        world_id: WorldId,
        payload: serde_json::Value,
    ) -> Result<EnqueueReceipt> {
        if self.registry.get_world(world_id).await?.is_none() {
            return Err(WarClawError::NotFound(format!("world {world_id}")));
        }
        let (receipt, task) = {
            let mut st = lock_state(&self.state);
            let busy = st.session.is_held();
            let receipt = st.manual.enqueue(
                kind,
                world_id,
                payload,
                Utc::now(),
                busy,
                self.config.average_task_secs.get(kind),
            );
            let task = st.manual.get(&receipt.task_id).cloned();
            (receipt, task)
        };
        if let Some(task) = &task {
            self.persist_task(task);
        }
        self.wake();
        Ok(receipt)
    }

    pub fn manual_status(&self, task_id: &str) -> Option<ManualTask> {
        lock_state(&self.state).manual.get(task_id).cloned()
    }

    pub fn is_locked_out(&self, world_id: WorldId) -> bool {
        lock_state(&self.state).lockouts.is_locked(world_id)
    }

    /// Operator override for a stuck lockout.
    pub fn clear_lockout(&self, world_id: WorldId) -> bool {
        lock_state(&self.state).lockouts.clear(world_id)
    }

    pub fn status(&self) -> SchedulerStatus {
        let st = lock_state(&self.state);
        snapshot(&st, &self.drivers, self.config.upcoming_limit)
    }
}

fn snapshot(st: &OrchestratorState, drivers: &DriverSet, upcoming: usize) -> SchedulerStatus {
    SchedulerStatus {
        session: st.session_status(Utc::now()),
        lockouts: st.lockouts.list(),
        upcoming: st.next_runs.upcoming(upcoming),
        scheduled_records: st.next_runs.len(),
        pending_manual: st.manual.pending_count(),
        drivers: drivers.kinds(),
        recent_runs: st.history.recent(20),
    }
}

fn log_outcome(world_id: WorldId, kind: TaskKind, outcome: &DriverOutcome, next_due: Option<DateTime<Utc>>) {
    let next = next_due
        .map(|d| format!(", next at {}", d.format("%H:%M:%S")))
        .unwrap_or_default();
    if outcome.success {
        tracing::info!("✅ {} for world {} done{}", kind, world_id, next);
    } else if outcome.bot_protection_detected {
        tracing::warn!("🛑 {} for world {} hit bot protection{}", kind, world_id, next);
    } else {
        tracing::warn!(
            "❌ {} for world {} failed: {}{}",
            kind,
            world_id,
            outcome.error.as_deref().unwrap_or("unknown error"),
            next
        );
    }
}

/// Spawn-able scheduler loop: ticks on an interval or when woken, and
/// drains all runnable work each time.
pub async fn spawn_scheduler(engine: Arc<SchedulerEngine>) {
    let every = engine.config.tick_interval_secs.max(1);
    tracing::info!("⏰ Scheduler started (check every {}s)", every);

    let mut interval = tokio::time::interval(Duration::from_secs(every));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let wake = engine.wake.clone();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = wake.notified() => tracing::debug!("⏰ Scheduler woken"),
        }
        while let TickOutcome::Ran(report) = engine.tick().await {
            tracing::debug!(
                "⏰ Run finished: world {} / {} ({}s)",
                report.world_id,
                report.kind,
                (report.finished_at - report.started_at).num_seconds()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_queue::{BuildOffer, BuildSite, QueueItem, RemoteBuildState, Resources};
    use crate::executors::ConstructionQueueDriver;
    use crate::manual::ManualTaskStatus;
    use crate::testing::{ScriptedDriver, StaticCredentials, StaticWorlds, world};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warclaw_core::IntervalBounds;

    fn drivers_for_all(driver: Arc<dyn PageDriver>) -> DriverSet {
        TaskKind::ALL
            .iter()
            .fold(DriverSet::new(), |set, kind| set.with(*kind, driver.clone()))
    }

    fn engine_with(
        worlds: Vec<World>,
        drivers: DriverSet,
        config: SchedulerConfig,
    ) -> (SchedulerEngine, Arc<StaticWorlds>) {
        let registry = Arc::new(StaticWorlds::new(worlds));
        let engine = SchedulerEngine::new(
            registry.clone(),
            registry.clone(),
            Arc::new(StaticCredentials::default()),
            drivers,
            config,
        );
        (engine, registry)
    }

    fn make_due(engine: &SchedulerEngine, world_id: WorldId, kind: TaskKind) {
        lock_state(&engine.state)
            .next_runs
            .schedule(world_id, kind, Utc::now() - ChronoDuration::seconds(1));
    }

    #[tokio::test]
    async fn test_tick_runs_due_record_and_reschedules() {
        let driver = Arc::new(ScriptedDriver::new());
        let (engine, _) = engine_with(
            vec![world(1, &[TaskKind::Scavenging])],
            drivers_for_all(driver.clone()),
            SchedulerConfig::default(),
        );
        make_due(&engine, 1, TaskKind::Scavenging);

        let before = Utc::now();
        let TickOutcome::Ran(report) = engine.tick().await else {
            panic!("expected a run");
        };
        assert!(report.outcome.success);
        let due = report.next_due.unwrap();
        assert!(due >= before + ChronoDuration::minutes(10));
        assert!(due <= Utc::now() + ChronoDuration::minutes(15));
        assert_eq!(driver.calls(), vec![(1, false)]);
        assert!(matches!(engine.tick().await, TickOutcome::Idle));
        assert!(!lock_state(&engine.state).session.is_held());
    }

    #[tokio::test]
    async fn test_busy_session_defers_tick() {
        let (engine, _) = engine_with(
            vec![world(1, &[TaskKind::Scavenging])],
            drivers_for_all(Arc::new(ScriptedDriver::new())),
            SchedulerConfig::default(),
        );
        make_due(&engine, 1, TaskKind::Scavenging);
        let guard = SessionGuard::try_begin(&engine.state, 2, TaskKind::MiniAttacks, Utc::now()).unwrap();
        assert!(matches!(engine.tick().await, TickOutcome::Busy));
        drop(guard);
        assert!(matches!(engine.tick().await, TickOutcome::Ran(_)));
    }

    #[tokio::test]
    async fn test_failures_still_reschedule() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push(DriverOutcome::failed("unexpected page layout"));
        let (engine, _) = engine_with(
            vec![world(1, &[TaskKind::MiniAttacks])],
            drivers_for_all(driver),
            SchedulerConfig::default(),
        );
        make_due(&engine, 1, TaskKind::MiniAttacks);

        let TickOutcome::Ran(report) = engine.tick().await else {
            panic!("expected a run");
        };
        assert!(!report.outcome.success);
        assert!(report.next_due.is_some());
        assert_eq!(report.lockout, LockoutTransition::Unchanged);
        assert_eq!(engine.status().recent_runs.len(), 1);
        assert!(!engine.status().recent_runs[0].configuration_error);
    }

    #[tokio::test]
    async fn test_missing_credentials_is_a_failed_run() {
        let driver = Arc::new(ScriptedDriver::new());
        let registry = Arc::new(StaticWorlds::new(vec![world(1, &[TaskKind::Scavenging])]));
        let engine = SchedulerEngine::new(
            registry.clone(),
            registry,
            Arc::new(StaticCredentials { missing: vec![1] }),
            drivers_for_all(driver.clone()),
            SchedulerConfig::default(),
        );
        make_due(&engine, 1, TaskKind::Scavenging);

        let TickOutcome::Ran(report) = engine.tick().await else {
            panic!("expected a run");
        };
        assert!(!report.outcome.success);
        assert!(report.outcome.error.unwrap().contains("Credential"));
        assert!(report.next_due.is_some());
        assert!(driver.calls().is_empty());
        assert!(engine.status().recent_runs[0].configuration_error);
    }

    #[tokio::test]
    async fn test_missing_driver_is_a_failed_run() {
        let (engine, _) = engine_with(
            vec![world(1, &[TaskKind::ArmyTraining])],
            DriverSet::new(),
            SchedulerConfig::default(),
        );
        make_due(&engine, 1, TaskKind::ArmyTraining);
        let TickOutcome::Ran(report) = engine.tick().await else {
            panic!("expected a run");
        };
        assert!(report.outcome.error.unwrap().contains("No driver registered"));
        assert!(engine.status().recent_runs[0].configuration_error);
    }

    #[tokio::test]
    async fn test_run_timeout_frees_session() {
        let driver = Arc::new(ScriptedDriver::with_delay(std::time::Duration::from_secs(30)));
        let (engine, _) = engine_with(
            vec![world(1, &[TaskKind::Scavenging])],
            drivers_for_all(driver),
            SchedulerConfig {
                run_timeout_secs: 1,
                ..SchedulerConfig::default()
            },
        );
        make_due(&engine, 1, TaskKind::Scavenging);

        let TickOutcome::Ran(report) = engine.tick().await else {
            panic!("expected a run");
        };
        assert_eq!(report.outcome.error.as_deref(), Some("Timed out after 1s"));
        assert!(report.next_due.is_some());
        assert!(!lock_state(&engine.state).session.is_held());
    }

    #[tokio::test]
    async fn test_disabling_feature_removes_record() {
        let driver = Arc::new(ScriptedDriver::new());
        let (engine, registry) = engine_with(
            vec![world(1, &[TaskKind::Scavenging])],
            drivers_for_all(driver.clone()),
            SchedulerConfig::default(),
        );
        assert_eq!(engine.rebuild_from_settings().await.unwrap(), 1);

        registry
            .set_feature_enabled(1, TaskKind::Scavenging, false)
            .await
            .unwrap();
        let changes = engine.update_world_task_states(1).await.unwrap();
        assert!(changes.contains(&(TaskKind::Scavenging, ScheduleChange::Removed)));
        assert!(engine.upcoming_schedule(10).is_empty());

        // Even well past the old due time nothing is selected.
        assert!(matches!(engine.tick().await, TickOutcome::Idle));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_enabling_feature_schedules_near_term_run() {
        let (engine, registry) = engine_with(
            vec![world(1, &[])],
            DriverSet::new(),
            SchedulerConfig::default(),
        );
        registry
            .set_feature_enabled(1, TaskKind::ExternalSync, true)
            .await
            .unwrap();
        let now = Utc::now();
        let changes = engine.update_world_task_states(1).await.unwrap();
        let added: Vec<_> = changes
            .iter()
            .filter_map(|(k, c)| match c {
                ScheduleChange::Added(due) => Some((*k, *due)),
                _ => None,
            })
            .collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, TaskKind::ExternalSync);
        assert!(added[0].1 <= now + ChronoDuration::seconds(31));

        // A second update leaves the existing record alone.
        let again = engine.update_world_task_states(1).await.unwrap();
        assert!(again.iter().all(|(_, c)| *c == ScheduleChange::Unchanged));
    }

    #[tokio::test]
    async fn test_inactive_and_removed_worlds() {
        let driver = Arc::new(ScriptedDriver::new());
        let (engine, registry) = engine_with(
            vec![world(1, &[TaskKind::Scavenging])],
            drivers_for_all(driver),
            SchedulerConfig::default(),
        );
        make_due(&engine, 1, TaskKind::Scavenging);
        registry.update(1, |w| w.active = false);
        // Inactive worlds are not selected at all.
        assert!(matches!(engine.tick().await, TickOutcome::Idle));
        assert_eq!(engine.upcoming_schedule(5).len(), 1);

        registry.remove(1);
        engine.rebuild_from_settings().await.unwrap();
        assert!(engine.upcoming_schedule(5).is_empty());
    }

    #[tokio::test]
    async fn test_lockout_scenario() {
        let driver = Arc::new(ScriptedDriver::new());
        let (engine, _) = engine_with(
            vec![world(3, &TaskKind::ALL), world(4, &TaskKind::ALL)],
            drivers_for_all(driver.clone()),
            SchedulerConfig::default(),
        );
        driver.push(DriverOutcome::bot_protection("captcha on rally point"));
        make_due(&engine, 3, TaskKind::Scavenging);

        let TickOutcome::Ran(report) = engine.tick().await else {
            panic!("expected a run");
        };
        assert_eq!(report.lockout, LockoutTransition::Blocked);
        assert!(engine.is_locked_out(3));

        for kind in TaskKind::ALL {
            make_due(&engine, 3, kind);
            make_due(&engine, 4, kind);
        }
        for _ in 0..5 {
            let TickOutcome::Ran(report) = engine.tick().await else {
                panic!("world 4 still has work");
            };
            assert_eq!(report.world_id, 4);
        }
        assert!(matches!(engine.tick().await, TickOutcome::Idle));
        assert!(driver.calls()[1..].iter().all(|(w, _)| *w == 4));

        let result = engine
            .trigger_now(3, TaskKind::MiniAttacks, serde_json::Value::Null)
            .await;
        assert!(result.success);
        assert!(result.message.contains("lockout cleared"));
        assert!(!engine.is_locked_out(3));
        assert_eq!(driver.calls().last(), Some(&(3, true)));
        // The trigger leaves world 3's schedule as it was.
        let world3: Vec<NextRunRecord> = engine
            .upcoming_schedule(20)
            .into_iter()
            .filter(|r| r.world_id == 3)
            .collect();
        assert_eq!(world3.len(), 5);
        assert!(world3
            .iter()
            .any(|r| r.kind == TaskKind::MiniAttacks && r.due_at <= Utc::now()));
    }

    #[tokio::test]
    async fn test_trigger_reports_busy() {
        let (engine, _) = engine_with(
            vec![world(1, &[])],
            drivers_for_all(Arc::new(ScriptedDriver::new())),
            SchedulerConfig::default(),
        );
        let _guard = SessionGuard::try_begin(&engine.state, 7, TaskKind::ExternalSync, Utc::now()).unwrap();
        let result = engine
            .trigger_now(1, TaskKind::Scavenging, serde_json::Value::Null)
            .await;
        assert!(!result.success);
        assert!(result.message.contains("busy"));

        let missing = engine
            .trigger_now(99, TaskKind::Scavenging, serde_json::Value::Null)
            .await;
        assert!(missing.message.contains("not found"));
    }

    #[tokio::test]
    async fn test_manual_task_runs_for_locked_world() {
        let driver = Arc::new(ScriptedDriver::new());
        let (engine, _) = engine_with(
            vec![world(3, &[TaskKind::Scavenging])],
            drivers_for_all(driver.clone()),
            SchedulerConfig::default(),
        );
        lock_state(&engine.state)
            .lockouts
            .apply(3, TaskKind::Scavenging, true, true, None, Utc::now());
        make_due(&engine, 3, TaskKind::Scavenging);

        let receipt = engine
            .enqueue_manual(TaskKind::ArmyTraining, 3, serde_json::json!({"spear": 10}))
            .await
            .unwrap();
        assert_eq!(receipt.queue_position, 1);
        assert_eq!(receipt.estimated_wait_secs, 0);

        let TickOutcome::Ran(report) = engine.tick().await else {
            panic!("manual task should run");
        };
        assert!(report.manual);
        assert_eq!(report.lockout, LockoutTransition::Cleared);
        let task = engine.manual_status(&receipt.task_id).unwrap();
        assert_eq!(task.status, ManualTaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(driver.calls(), vec![(3, true)]);
    }

    #[tokio::test]
    async fn test_enqueue_positions_while_busy() {
        let (engine, _) = engine_with(
            vec![world(1, &[]), world(2, &[])],
            DriverSet::new(),
            SchedulerConfig::default(),
        );
        let guard = SessionGuard::try_begin(&engine.state, 2, TaskKind::Scavenging, Utc::now()).unwrap();
        let mut positions = Vec::new();
        for _ in 0..3 {
            let r = engine
                .enqueue_manual(TaskKind::MiniAttacks, 1, serde_json::Value::Null)
                .await
                .unwrap();
            assert_eq!(r.estimated_wait_secs, r.queue_position as u64 * 90);
            positions.push(r.queue_position);
        }
        assert_eq!(positions, vec![1, 2, 3]);
        drop(guard);

        let unknown = engine
            .enqueue_manual(TaskKind::MiniAttacks, 42, serde_json::Value::Null)
            .await;
        assert!(matches!(unknown, Err(WarClawError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_manual_tasks_survive_restart() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let (engine, _) = engine_with(vec![world(1, &[])], DriverSet::new(), SchedulerConfig::default());
        let engine = engine.with_db(db.clone()).unwrap();
        let pending = engine
            .enqueue_manual(TaskKind::Scavenging, 1, serde_json::Value::Null)
            .await
            .unwrap();
        let executing = engine
            .enqueue_manual(TaskKind::Scavenging, 1, serde_json::Value::Null)
            .await
            .unwrap();
        {
            let mut st = lock_state(&engine.state);
            let task = st.manual.mark_executing(&executing.task_id, Utc::now()).unwrap();
            db.save_manual_task(&task).unwrap();
        }

        let (restarted, _) = engine_with(vec![world(1, &[])], DriverSet::new(), SchedulerConfig::default());
        let restarted = restarted.with_db(db).unwrap();
        assert_eq!(
            restarted.manual_status(&pending.task_id).unwrap().status,
            ManualTaskStatus::Pending
        );
        let interrupted = restarted.manual_status(&executing.task_id).unwrap();
        assert_eq!(interrupted.status, ManualTaskStatus::Failed);
        assert_eq!(interrupted.error.as_deref(), Some("Interrupted by restart"));
    }

    /// Counts concurrently running executions.
    #[derive(Default)]
    struct ConcurrencyProbe {
        active: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl PageDriver for ConcurrencyProbe {
        fn name(&self) -> &str {
            "probe"
        }

        async fn execute(&self, _: &World, _: &ExecutionContext) -> DriverOutcome {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            DriverOutcome::ok(serde_json::Value::Null)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_holder_under_concurrent_ticks_and_intake() {
        let probe = Arc::new(ConcurrencyProbe::default());
        let (engine, _) = engine_with(
            vec![world(1, &TaskKind::ALL), world(2, &TaskKind::ALL)],
            drivers_for_all(probe.clone()),
            SchedulerConfig::default(),
        );
        let engine = Arc::new(engine);
        for kind in TaskKind::ALL {
            make_due(&engine, 1, kind);
            make_due(&engine, 2, kind);
        }

        let mut handles = Vec::new();
        for i in 0..4 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    engine
                        .enqueue_manual(TaskKind::Scavenging, 1 + (i % 2), serde_json::Value::Null)
                        .await
                        .unwrap();
                    engine.tick().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        while let TickOutcome::Ran(_) = engine.tick().await {}

        assert_eq!(probe.max_seen.load(Ordering::SeqCst), 1);
        let status = engine.status();
        assert!(status.session.is_none());
        assert_eq!(status.pending_manual, 0);
    }

    struct W17Site {
        submissions: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BuildSite for W17Site {
        async fn read_state(&self, _: &World, _: &ExecutionContext) -> Result<RemoteBuildState> {
            Ok(RemoteBuildState {
                levels: [("farm".to_string(), 11)].into_iter().collect(),
                queued: Vec::new(),
                queue_capacity: 1,
                resources: Resources {
                    wood: 5000,
                    clay: 5000,
                    iron: 5000,
                },
                offers: vec![BuildOffer {
                    subject_id: "farm".into(),
                    next_level: 12,
                    cost: Resources {
                        wood: 1200,
                        clay: 1400,
                        iron: 900,
                    },
                    prerequisites_met: true,
                }],
            })
        }

        async fn submit(&self, _: &World, _: &ExecutionContext, subject_id: &str) -> Result<()> {
            self.submissions.lock().unwrap().push(subject_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_construction_scenario_w17() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        db.add_wishlist_item(17, &QueueItem::new("farm", 12, 1)).unwrap();
        let site = Arc::new(W17Site {
            submissions: Mutex::new(Vec::new()),
        });
        let drivers = DriverSet::new().with(
            TaskKind::ConstructionQueue,
            Arc::new(ConstructionQueueDriver::new(site.clone(), db.clone())),
        );
        let mut w17 = world(17, &[TaskKind::ConstructionQueue]);
        w17.code = "W17".into();
        w17.intervals
            .insert(TaskKind::ConstructionQueue, IntervalBounds::new(10, 15));
        let (engine, _) = engine_with(vec![w17], drivers, SchedulerConfig::default());
        make_due(&engine, 17, TaskKind::ConstructionQueue);

        let before = Utc::now();
        let TickOutcome::Ran(report) = engine.tick().await else {
            panic!("expected a run");
        };
        let after = Utc::now();

        assert!(report.outcome.success);
        assert_eq!(*site.submissions.lock().unwrap(), vec!["farm".to_string()]);
        assert!(db.load_wishlist(17).unwrap().is_empty());
        let due = report.next_due.unwrap();
        assert!(due >= before + ChronoDuration::minutes(10));
        assert!(due <= after + ChronoDuration::minutes(15));
    }
}
