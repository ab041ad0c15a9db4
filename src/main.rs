//! # WarClaw
//!
//! Unattended multi-world automation agent. One browser session, many
//! logged-in worlds, a scheduler that never lets two tasks drive the
//! session at once.
//!
//! Usage:
//!   warclaw                          # Start scheduler + control surface
//!   warclaw --port 8080              # Custom port
//!   warclaw --init-config            # Write a default config and exit

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use warclaw_core::config::WarClawConfig;
use warclaw_core::{CookieFileStore, TaskKind};
use warclaw_gateway::{AppState, GatewayDb};
use warclaw_scheduler::{
    ConstructionQueueDriver, DriverSet, ExternalSyncDriver, SchedulerDb, SchedulerEngine,
    WorkerClient, WorkerDriver, spawn_scheduler,
};

#[derive(Parser)]
#[command(
    name = "warclaw",
    version,
    about = "⚔️ WarClaw: single-session multi-world automation agent"
)]
struct Cli {
    /// Config file (default: $WARCLAW_CONFIG, else ~/.warclaw/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control surface port (overrides [gateway].port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides [gateway].host)
    #[arg(long)]
    host: Option<String>,

    /// Data directory (overrides data_dir)
    #[arg(long)]
    data_dir: Option<String>,

    /// Write a default config file and exit
    #[arg(long)]
    init_config: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// One driver per kind, all backed by the remote worker.
fn build_drivers(config: &WarClawConfig, db: &Arc<SchedulerDb>) -> DriverSet {
    if config.worker.endpoint.trim().is_empty() {
        tracing::warn!("⚠️ No [worker].endpoint configured; every run will fail until one is set");
        return DriverSet::new();
    }

    let client = Arc::new(WorkerClient::new(&config.worker.endpoint));
    tracing::info!("🔌 Automation worker: {}", client.endpoint());

    TaskKind::ALL
        .into_iter()
        .fold(DriverSet::new(), |set, kind| match kind {
            TaskKind::ConstructionQueue => set.with(
                kind,
                Arc::new(ConstructionQueueDriver::new(client.clone(), db.clone())),
            ),
            TaskKind::ExternalSync => set.with(
                kind,
                Arc::new(ExternalSyncDriver::new(
                    client.clone(),
                    client.clone(),
                    db.clone(),
                    config.sync.clone(),
                )),
            ),
            _ => set.with(kind, Arc::new(WorkerDriver::new(client.clone(), kind))),
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "warclaw=debug,warclaw_scheduler=debug,warclaw_gateway=debug,tower_http=debug"
    } else {
        "warclaw=info,warclaw_scheduler=info,warclaw_gateway=info,warclaw_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("WARCLAW_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(WarClawConfig::default_path);

    // --init-config: write defaults and exit
    if cli.init_config {
        if config_path.exists() {
            println!("⚠️  Config already exists: {}", config_path.display());
        } else {
            WarClawConfig::default().save_to(&config_path)?;
            println!("✅ Default config written to {}", config_path.display());
        }
        return Ok(());
    }

    let mut config = if config_path.exists() {
        WarClawConfig::load_from(&config_path)?
    } else {
        tracing::info!("📄 No config at {}, using defaults", config_path.display());
        WarClawConfig::default()
    };
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if let Some(host) = cli.host.clone() {
        config.gateway.host = host;
    }
    if let Some(dir) = cli.data_dir.clone() {
        config.data_dir = dir;
    }

    // Ensure directories exist
    let data_dir = config.data_path();
    std::fs::create_dir_all(&data_dir)?;

    // Open databases
    let scheduler_db = Arc::new(SchedulerDb::open(&data_dir.join("scheduler.db"))?);
    let gateway_db = Arc::new(GatewayDb::open(&data_dir.join("gateway.db"), &config.intervals)?);
    gateway_db.seed_worlds(&config.worlds)?;

    let credentials = Arc::new(CookieFileStore::new(
        &expand_path(&config.credentials.cookie_dir),
        &config.worker.user_agent,
    ));
    let drivers = build_drivers(&config, &scheduler_db);

    let engine = SchedulerEngine::new(
        gateway_db.clone(),
        gateway_db.clone(),
        credentials,
        drivers,
        config.scheduler.clone(),
    )
    .with_db(scheduler_db.clone())?;
    let records = engine.rebuild_from_settings().await?;
    let engine = Arc::new(engine);

    println!("⚔️ WarClaw v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "   🌐 Control surface: http://{}:{}",
        config.gateway.host, config.gateway.port
    );
    println!("   📂 Data Dir:        {}", data_dir.display());
    println!("   🌍 Worlds:          {}", gateway_db.world_count()?);
    println!("   📅 Scheduled:       {records}");
    println!();

    tokio::spawn(spawn_scheduler(engine.clone()));

    let state = AppState {
        pairing_code: warclaw_gateway::server::load_pairing_code(&config.gateway, &config_path),
        gateway_config: config.gateway.clone(),
        start_time: std::time::Instant::now(),
        scheduler: engine,
        db: gateway_db,
        scheduler_db,
    };
    warclaw_gateway::start(state).await
}
