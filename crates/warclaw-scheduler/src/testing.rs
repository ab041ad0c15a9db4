//! In-crate fakes for engine and executor tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use warclaw_core::traits::{CredentialProvider, PageDriver, SettingsStore, WorldRegistry};
use warclaw_core::{
    DriverOutcome, ExecutionContext, IntervalBounds, Result, SessionCredentials, TaskKind,
    WarClawError, World, WorldId,
};

pub fn test_context() -> ExecutionContext {
    ExecutionContext {
        credentials: SessionCredentials {
            cookie_header: "sid=test".into(),
            user_agent: "warclaw-test".into(),
        },
        payload: serde_json::Value::Null,
        manual: false,
        timeout: Duration::from_secs(5),
    }
}

/// A world with the given kinds enabled.
pub fn world(id: WorldId, kinds: &[TaskKind]) -> World {
    let mut w = World::new(id, &format!("w{id}"));
    for kind in kinds {
        w.features.insert(*kind, true);
    }
    w
}

/// Mutable in-memory registry + settings store.
#[derive(Default)]
pub struct StaticWorlds {
    worlds: Mutex<BTreeMap<WorldId, World>>,
    defaults: BTreeMap<TaskKind, IntervalBounds>,
}

impl StaticWorlds {
    pub fn new(worlds: Vec<World>) -> Self {
        Self {
            worlds: Mutex::new(worlds.into_iter().map(|w| (w.id, w)).collect()),
            defaults: TaskKind::ALL
                .iter()
                .map(|k| (*k, IntervalBounds::new(10, 15)))
                .collect(),
        }
    }

    pub fn update(&self, id: WorldId, f: impl FnOnce(&mut World)) {
        if let Some(w) = self.worlds.lock().unwrap().get_mut(&id) {
            f(w);
        }
    }

    pub fn remove(&self, id: WorldId) {
        self.worlds.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl WorldRegistry for StaticWorlds {
    async fn list_worlds(&self) -> Result<Vec<World>> {
        Ok(self.worlds.lock().unwrap().values().cloned().collect())
    }

    async fn get_world(&self, id: WorldId) -> Result<Option<World>> {
        Ok(self.worlds.lock().unwrap().get(&id).cloned())
    }
}

#[async_trait]
impl SettingsStore for StaticWorlds {
    async fn set_feature_enabled(&self, world_id: WorldId, kind: TaskKind, enabled: bool) -> Result<()> {
        self.update(world_id, |w| {
            w.features.insert(kind, enabled);
        });
        Ok(())
    }

    async fn set_interval_bounds(&self, world_id: WorldId, kind: TaskKind, bounds: IntervalBounds) -> Result<()> {
        self.update(world_id, |w| {
            w.intervals.insert(kind, bounds);
        });
        Ok(())
    }

    fn default_intervals(&self) -> BTreeMap<TaskKind, IntervalBounds> {
        self.defaults.clone()
    }
}

/// Hands out fixed credentials, or a credential error for listed worlds.
#[derive(Default)]
pub struct StaticCredentials {
    pub missing: Vec<WorldId>,
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials_for(&self, world: &World) -> Result<SessionCredentials> {
        if self.missing.contains(&world.id) {
            return Err(WarClawError::Credential(format!("no cookie file for {}", world.code)));
        }
        Ok(test_context().credentials)
    }
}

/// Returns queued outcomes in order (then plain success) and records calls.
#[derive(Default)]
pub struct ScriptedDriver {
    outcomes: Mutex<VecDeque<DriverOutcome>>,
    calls: Mutex<Vec<(WorldId, bool)>>,
    delay: Option<Duration>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push(&self, outcome: DriverOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// `(world_id, manual)` per call.
    pub fn calls(&self) -> Vec<(WorldId, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, world: &World, ctx: &ExecutionContext) -> DriverOutcome {
        self.calls.lock().unwrap().push((world.id, ctx.manual));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.outcomes.lock().unwrap().pop_front();
        next.unwrap_or_else(|| DriverOutcome::ok(serde_json::Value::Null))
    }
}
