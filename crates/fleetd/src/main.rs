//! fleetd: the FleetGrid daemon.
//!
//! Single binary that assembles the rollout control plane:
//! - State store (redb)
//! - In-process agent registry and release catalog (seeded from a fleet file)
//! - Rollout controller
//! - Scheduler loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd standalone --port 8443 --data-dir /var/lib/fleetgrid --fleet-file fleet.json
//! ```

mod config;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleetgrid_rollout::{
    AgentRegistry, FleetSeed, InMemoryFleet, ReleaseCatalog, RolloutController,
};
use fleetgrid_scheduler::RolloutScheduler;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{FileConfig, LogFormat, Settings, parse_duration};

const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid rollout daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller, scheduler and API in one process.
    Standalone {
        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON file with the agents and releases to serve.
        #[arg(long)]
        fleet_file: Option<PathBuf>,

        /// Scheduler tick interval, e.g. "5s".
        #[arg(long)]
        tick_interval: Option<String>,

        /// Log output format.
        #[arg(long, value_enum)]
        log_format: Option<LogFormat>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            port,
            data_dir,
            config,
            fleet_file,
            tick_interval,
            log_format,
        } => {
            let mut file = match &config {
                Some(path) => FileConfig::load(path)?,
                None => FileConfig::default(),
            };
            if let Some(port) = port {
                file.server.port = port;
            }
            if let Some(dir) = data_dir {
                file.server.data_dir = dir;
            }
            if let Some(path) = fleet_file {
                file.server.fleet_file = Some(path);
            }
            if let Some(format) = log_format {
                file.server.log_format = format;
            }
            if let Some(interval) = tick_interval {
                parse_duration("--tick-interval", &interval)?;
                file.scheduler.tick_interval = interval;
            }
            let settings = file.into_settings()?;

            init_tracing(settings.log_format);
            if let Some(path) = &config {
                info!(path = ?path, "config loaded");
            }
            run_standalone(settings).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_fleet(path: Option<&Path>) -> anyhow::Result<InMemoryFleet> {
    let Some(path) = path else {
        warn!("no fleet file given; starting with an empty fleet");
        return Ok(InMemoryFleet::new().with_auto_apply(true));
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fleet file {}", path.display()))?;
    let seed: FleetSeed = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse fleet file {}", path.display()))?;
    info!(
        path = ?path,
        agents = seed.agents.len(),
        releases = seed.releases.len(),
        "fleet loaded"
    );
    Ok(InMemoryFleet::from_seed(seed).with_auto_apply(true))
}

async fn run_standalone(settings: Settings) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting in standalone mode");

    // Ensure data directory exists.
    std::fs::create_dir_all(&settings.data_dir)?;
    let db_path = settings.data_dir.join("fleetgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = fleetgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let fleet = load_fleet(settings.fleet_file.as_deref())?;
    let registry: Arc<dyn AgentRegistry> = Arc::new(fleet.clone());
    let catalog: Arc<dyn ReleaseCatalog> = Arc::new(fleet);

    let controller = RolloutController::new(store, registry, catalog, settings.rollout)?;
    let resumed = controller.active_rollout_ids()?.len();
    info!(active_rollouts = resumed, "rollout controller initialized");

    let mut scheduler = RolloutScheduler::new(controller.clone(), settings.tick_interval)?;
    info!(interval = ?settings.tick_interval, "scheduler initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = fleetgrid_api::build_router(controller);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for in-flight ticks to land.
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "scheduler task failed");
    }

    info!("FleetGrid daemon stopped");
    Ok(())
}
