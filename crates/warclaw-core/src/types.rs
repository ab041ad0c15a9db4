//! Domain types: worlds, task kinds, interval bounds and driver results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::WarClawError;

/// Numeric world identifier (registry primary key).
pub type WorldId = i64;

/// Every kind of work the agent can perform against a world.
///
/// Declaration order is the fixed scheduling priority used to break ties
/// between candidates due at the same instant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Scavenging,
    ConstructionQueue,
    MiniAttacks,
    ArmyTraining,
    ExternalSync,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Scavenging,
        TaskKind::ConstructionQueue,
        TaskKind::MiniAttacks,
        TaskKind::ArmyTraining,
        TaskKind::ExternalSync,
    ];

    /// Tie-break priority (lower runs first).
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Scavenging => "scavenging",
            TaskKind::ConstructionQueue => "construction_queue",
            TaskKind::MiniAttacks => "mini_attacks",
            TaskKind::ArmyTraining => "army_training",
            TaskKind::ExternalSync => "external_sync",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = WarClawError;

    /// Accepts `construction_queue` as well as `construction-queue`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| WarClawError::NotFound(format!("task kind '{s}'")))
    }
}

/// Randomized re-run window, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalBounds {
    pub min_minutes: u32,
    pub max_minutes: u32,
}

impl IntervalBounds {
    /// Build bounds, swapping them if given in the wrong order.
    pub fn new(min_minutes: u32, max_minutes: u32) -> Self {
        if min_minutes <= max_minutes {
            Self { min_minutes, max_minutes }
        } else {
            Self {
                min_minutes: max_minutes,
                max_minutes: min_minutes,
            }
        }
    }

    /// Inclusive bounds in seconds.
    pub fn as_seconds(&self) -> (i64, i64) {
        (
            i64::from(self.min_minutes) * 60,
            i64::from(self.max_minutes) * 60,
        )
    }
}

/// One independently logged-in game account.
///
/// Owned by the external registry; the orchestrator only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct World {
    pub id: WorldId,
    pub code: String,
    pub display_name: String,
    pub active: bool,
    #[serde(default)]
    pub features: BTreeMap<TaskKind, bool>,
    /// Per-world overrides; kinds without an entry use the configured defaults.
    #[serde(default)]
    pub intervals: BTreeMap<TaskKind, IntervalBounds>,
}

impl World {
    pub fn new(id: WorldId, code: &str) -> Self {
        Self {
            id,
            code: code.to_string(),
            display_name: code.to_string(),
            active: true,
            features: BTreeMap::new(),
            intervals: BTreeMap::new(),
        }
    }

    pub fn feature_enabled(&self, kind: TaskKind) -> bool {
        self.features.get(&kind).copied().unwrap_or(false)
    }

    /// Whether automatic scheduling should consider this (world, kind) pair at all.
    pub fn schedulable(&self, kind: TaskKind) -> bool {
        self.active && self.feature_enabled(kind)
    }

    pub fn interval_for(
        &self,
        kind: TaskKind,
        defaults: &BTreeMap<TaskKind, IntervalBounds>,
    ) -> Option<IntervalBounds> {
        self.intervals
            .get(&kind)
            .or_else(|| defaults.get(&kind))
            .copied()
    }
}

/// Login state handed to a driver for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCredentials {
    /// Raw `Cookie` header value.
    pub cookie_header: String,
    #[serde(default)]
    pub user_agent: String,
}

/// Everything a driver needs besides the world itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub credentials: SessionCredentials,
    /// Manual-task payload, `Null` for scheduled runs.
    pub payload: serde_json::Value,
    /// True for operator-initiated runs.
    pub manual: bool,
    /// Budget for each network-bound step.
    pub timeout: Duration,
}

/// Per-item result inside a partially successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub label: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What a driver reports back. Drivers never return errors past this boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverOutcome {
    pub success: bool,
    #[serde(default)]
    pub bot_protection_detected: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub items: Vec<ItemResult>,
}

impl DriverOutcome {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn bot_protection(error: impl Into<String>) -> Self {
        Self {
            success: false,
            bot_protection_detected: true,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Convert an error caught at the driver boundary into a soft failure.
    pub fn from_error(err: &WarClawError) -> Self {
        if err.is_bot_protection() {
            Self::bot_protection(err.to_string())
        } else {
            Self::failed(err.to_string())
        }
    }

    pub fn with_items(mut self, items: Vec<ItemResult>) -> Self {
        self.items = items;
        self
    }
}
