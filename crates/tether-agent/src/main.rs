//! Tether Agent
//!
//! Failover daemon running on a multi-WAN gateway.
//!
//! - Polls every configured uplink member on its own cadence
//! - Scores samples and fails members over / restores them via the routing
//!   controller
//! - Tracks GPS position, movement and location clusters
//! - Serves Prometheus metrics and a JSON status API
//! - In `--simulate` mode, generates member metrics and GPS fixes locally

mod collectors;
mod controller;
mod notifier;
mod portal;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tether_engine::config::TetherConfig;
use tether_engine::gps::{GpsCollector, SimulatedGps};
use tether_engine::interfaces::{Collector, Controller};
use tether_engine::runtime::{self, Dependencies};
use tracing_subscriber::EnvFilter;

/// Members used by `--simulate` when no config file exists.
const SIMULATED_CONFIG: &str = r#"
version = 1

[[members]]
name = "starlink"
class = "satellite"
interface = "wan"
metric = 1

[[members]]
name = "lte"
class = "cellular"
interface = "wwan0"
metric = 2

[[members]]
name = "wifi"
class = "wifi"
interface = "wlan0"
metric = 3

[gps]
sources = ["simulated"]
interval_s = 30
"#;

/// Tether uplink failover daemon.
#[derive(Parser, Debug)]
#[command(name = "tether-agent", about = "Tether uplink failover daemon")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, default_value = "/etc/tether/tether.toml")]
    config: PathBuf,

    /// Run in simulation mode (generated metrics, in-memory routing, simulated GPS).
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// State file override (member state, last fix, clusters).
    #[arg(long)]
    state: Option<PathBuf>,

    /// Status portal listen address.
    #[arg(long, default_value = "0.0.0.0:9109")]
    listen: String,

    /// Executable applying routing changes (`metric`, `switch`, `current`).
    #[arg(long)]
    controller: Option<PathBuf>,

    /// Echo requests per ping sample.
    #[arg(long, default_value_t = 5)]
    ping_count: u32,
}

fn load_config(cli: &Cli) -> anyhow::Result<TetherConfig> {
    let mut cfg = if cli.simulate && !cli.config.exists() {
        tracing::info!(path = %cli.config.display(), "config not found, using simulated members");
        TetherConfig::from_toml_str(SIMULATED_CONFIG)?
    } else {
        TetherConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    };
    if let Some(state) = &cli.state {
        cfg.state.path = Some(state.clone());
    }
    if cfg.members.is_empty() {
        anyhow::bail!("no members configured");
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    tracing::info!(
        config = %cli.config.display(),
        simulate = cli.simulate,
        members = cfg.members.len(),
        mode = ?cfg.decision.mode,
        "tether-agent starting"
    );

    // ── Collaborators ───────────────────────────────────────────
    let collector: Arc<dyn Collector> = if cli.simulate {
        Arc::new(collectors::SimulatedCollector::new())
    } else {
        Arc::new(collectors::PingCollector::new(&cfg.members, cli.ping_count))
    };

    let controller: Arc<dyn Controller> = match &cli.controller {
        Some(program) if !cli.simulate => Arc::new(controller::CommandController::new(program)),
        _ => {
            if !cli.simulate {
                tracing::warn!("no --controller given, routing changes stay in memory");
            }
            let first = cfg.members.first().map(|m| m.member.name.clone());
            Arc::new(controller::MemoryController::new(first))
        }
    };

    let simulated_gps = cli
        .simulate
        .then(|| Arc::new(SimulatedGps::moving(59.3293, 18.0686, 25.0)));
    let gps = cfg
        .gps
        .enabled
        .then(|| GpsCollector::from_config(&cfg.gps, simulated_gps));

    let notifier = Arc::new(notifier::LogNotifier::new(
        cfg.notifications.rate_limit_per_hour,
    ));

    let listen: SocketAddr = cli.listen.parse()?;
    let gps_enabled = cfg.gps.enabled;
    let clustering_enabled = cfg.clustering.enabled;

    // ── Task 1: Engine runtime ──────────────────────────────────
    let handle = runtime::start(
        cfg,
        Dependencies {
            collector,
            controller,
            notifier: Some(notifier),
            gps,
            check_connectivity: !cli.simulate,
        },
    )
    .await?;

    // ── Task 2: Status portal (HTTP) ────────────────────────────
    let portal_state = Arc::new(portal::PortalState {
        shared: handle.shared(),
        simulate: cli.simulate,
        gps_enabled,
        clustering_enabled,
    });
    let portal_handle = tokio::spawn(portal::run(portal_state, listen));

    // ── Shutdown handling ───────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        result = portal_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("portal failed: {e}"),
                Err(e) => tracing::error!("portal task failed: {e}"),
                Ok(Ok(())) => {}
            }
        }
    }

    handle.shutdown().await?;
    tracing::info!("tether-agent stopped");
    Ok(())
}
