//! World registry and settings store.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{IntervalBounds, TaskKind, World, WorldId};

/// Read access to the configured worlds.
#[async_trait]
pub trait WorldRegistry: Send + Sync {
    async fn list_worlds(&self) -> Result<Vec<World>>;

    async fn get_world(&self, id: WorldId) -> Result<Option<World>>;

    /// Resolve a world by code (`W17`) or by numeric id (`17`).
    async fn find_world(&self, code_or_id: &str) -> Result<Option<World>> {
        if let Ok(id) = code_or_id.parse::<WorldId>()
            && let Some(world) = self.get_world(id).await?
        {
            return Ok(Some(world));
        }
        let worlds = self.list_worlds().await?;
        Ok(worlds
            .into_iter()
            .find(|w| w.code.eq_ignore_ascii_case(code_or_id)))
    }
}

/// Mutable per-world settings (feature toggles and interval bounds).
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn set_feature_enabled(&self, world: WorldId, kind: TaskKind, enabled: bool)
    -> Result<()>;

    async fn set_interval_bounds(
        &self,
        world: WorldId,
        kind: TaskKind,
        bounds: IntervalBounds,
    ) -> Result<()>;

    /// Bounds used for kinds a world does not override.
    fn default_intervals(&self) -> BTreeMap<TaskKind, IntervalBounds>;
}
