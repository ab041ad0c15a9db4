//! WarClaw configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, WarClawError};
use crate::types::{IntervalBounds, TaskKind, World, WorldId};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarClawConfig {
    /// Directory holding the SQLite databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Worlds seeded into the registry on first start.
    #[serde(default)]
    pub worlds: Vec<WorldSeed>,
}

fn default_data_dir() -> String { "~/.warclaw".into() }

impl Default for WarClawConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            gateway: GatewayConfig::default(),
            scheduler: SchedulerConfig::default(),
            intervals: IntervalsConfig::default(),
            worker: WorkerConfig::default(),
            credentials: CredentialsConfig::default(),
            sync: SyncConfig::default(),
            worlds: Vec::new(),
        }
    }
}

impl WarClawConfig {
    /// Load config from the default path (~/.warclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WarClawError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| WarClawError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| WarClawError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the WarClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".warclaw")
    }

    /// Data directory with `~` expanded.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "bool_true")]
    pub require_pairing: bool,
}

fn bool_true() -> bool { true }
fn default_port() -> u16 { 3100 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            require_pairing: true,
        }
    }
}

/// Scheduler loop and manual-queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// A freshly enabled feature runs within `[0, first_run_delay_secs]`.
    #[serde(default = "default_first_run_delay")]
    pub first_run_delay_secs: u64,
    /// Hard cap on one driver run.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    /// Budget for each network-bound step inside a run.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// Finished manual tasks older than this are evicted.
    #[serde(default = "default_manual_ttl")]
    pub manual_task_ttl_secs: u64,
    #[serde(default = "default_manual_max")]
    pub manual_task_max_retained: usize,
    #[serde(default = "default_upcoming_limit")]
    pub upcoming_limit: usize,
    /// Used to estimate the wait of a queued manual task.
    #[serde(default)]
    pub average_task_secs: KindDurations,
}

fn default_tick_interval() -> u64 { 15 }
fn default_first_run_delay() -> u64 { 30 }
fn default_run_timeout() -> u64 { 900 }
fn default_step_timeout() -> u64 { 60 }
fn default_manual_ttl() -> u64 { 24 * 3600 }
fn default_manual_max() -> usize { 200 }
fn default_upcoming_limit() -> usize { 20 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            first_run_delay_secs: default_first_run_delay(),
            run_timeout_secs: default_run_timeout(),
            step_timeout_secs: default_step_timeout(),
            manual_task_ttl_secs: default_manual_ttl(),
            manual_task_max_retained: default_manual_max(),
            upcoming_limit: default_upcoming_limit(),
            average_task_secs: KindDurations::default(),
        }
    }
}

/// Average duration of one run per kind, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindDurations {
    #[serde(default = "default_scavenging_secs")]
    pub scavenging: u64,
    #[serde(default = "default_construction_secs")]
    pub construction_queue: u64,
    #[serde(default = "default_mini_attacks_secs")]
    pub mini_attacks: u64,
    #[serde(default = "default_army_training_secs")]
    pub army_training: u64,
    #[serde(default = "default_external_sync_secs")]
    pub external_sync: u64,
}

fn default_scavenging_secs() -> u64 { 45 }
fn default_construction_secs() -> u64 { 30 }
fn default_mini_attacks_secs() -> u64 { 90 }
fn default_army_training_secs() -> u64 { 30 }
fn default_external_sync_secs() -> u64 { 60 }

impl Default for KindDurations {
    fn default() -> Self {
        Self {
            scavenging: default_scavenging_secs(),
            construction_queue: default_construction_secs(),
            mini_attacks: default_mini_attacks_secs(),
            army_training: default_army_training_secs(),
            external_sync: default_external_sync_secs(),
        }
    }
}

impl KindDurations {
    pub fn get(&self, kind: TaskKind) -> u64 {
        match kind {
            TaskKind::Scavenging => self.scavenging,
            TaskKind::ConstructionQueue => self.construction_queue,
            TaskKind::MiniAttacks => self.mini_attacks,
            TaskKind::ArmyTraining => self.army_training,
            TaskKind::ExternalSync => self.external_sync,
        }
    }
}

/// Default re-run windows per kind (minutes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalsConfig {
    #[serde(default = "default_scavenging_interval")]
    pub scavenging: IntervalBounds,
    #[serde(default = "default_construction_interval")]
    pub construction_queue: IntervalBounds,
    #[serde(default = "default_mini_attacks_interval")]
    pub mini_attacks: IntervalBounds,
    #[serde(default = "default_army_training_interval")]
    pub army_training: IntervalBounds,
    #[serde(default = "default_external_sync_interval")]
    pub external_sync: IntervalBounds,
}

fn default_scavenging_interval() -> IntervalBounds { IntervalBounds::new(30, 45) }
fn default_construction_interval() -> IntervalBounds { IntervalBounds::new(10, 15) }
fn default_mini_attacks_interval() -> IntervalBounds { IntervalBounds::new(20, 40) }
fn default_army_training_interval() -> IntervalBounds { IntervalBounds::new(60, 90) }
fn default_external_sync_interval() -> IntervalBounds { IntervalBounds::new(1, 3) }

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            scavenging: default_scavenging_interval(),
            construction_queue: default_construction_interval(),
            mini_attacks: default_mini_attacks_interval(),
            army_training: default_army_training_interval(),
            external_sync: default_external_sync_interval(),
        }
    }
}

impl IntervalsConfig {
    pub fn get(&self, kind: TaskKind) -> IntervalBounds {
        match kind {
            TaskKind::Scavenging => self.scavenging,
            TaskKind::ConstructionQueue => self.construction_queue,
            TaskKind::MiniAttacks => self.mini_attacks,
            TaskKind::ArmyTraining => self.army_training,
            TaskKind::ExternalSync => self.external_sync,
        }
    }

    pub fn as_map(&self) -> BTreeMap<TaskKind, IntervalBounds> {
        TaskKind::ALL.into_iter().map(|k| (k, self.get(k))).collect()
    }
}

/// Out-of-process automation worker that owns the page-level logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Base URL, e.g. `http://127.0.0.1:4100`. Empty = no worker configured.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0".into()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            user_agent: default_user_agent(),
        }
    }
}

/// Where per-world cookie files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_cookie_dir")]
    pub cookie_dir: String,
}

fn default_cookie_dir() -> String { "~/.warclaw/cookies".into() }

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self { cookie_dir: default_cookie_dir() }
    }
}

/// External planner synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Labeled field of a planned action that says whether it is due.
    #[serde(default = "default_due_field")]
    pub due_field: String,
    #[serde(default = "default_due_value")]
    pub due_value: String,
    /// Pause between consecutive sends.
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
}

fn default_due_field() -> String { "status".into() }
fn default_due_value() -> String { "send_now".into() }
fn default_pause_ms() -> u64 { 750 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            due_field: default_due_field(),
            due_value: default_due_value(),
            pause_ms: default_pause_ms(),
        }
    }
}

/// A world declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSeed {
    pub id: WorldId,
    pub code: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "bool_true")]
    pub active: bool,
    /// Kinds enabled on first start, e.g. `["construction_queue"]`.
    #[serde(default)]
    pub enabled: Vec<TaskKind>,
}

impl WorldSeed {
    pub fn to_world(&self) -> World {
        let mut world = World::new(self.id, &self.code);
        if !self.display_name.is_empty() {
            world.display_name = self.display_name.clone();
        }
        world.active = self.active;
        for kind in TaskKind::ALL {
            world.features.insert(kind, self.enabled.contains(&kind));
        }
        world
    }
}
