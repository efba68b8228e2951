//! flexgridd — the FlexGrid daemon.
//!
//! Single binary that assembles the controller:
//! - Configuration (flexgrid.toml)
//! - Capability backends (closed set, selected by config)
//! - Machine registry + redb snapshot
//! - Broker control loop
//! - Event bus wired to structured logging
//!
//! # Usage
//!
//! ```text
//! flexgridd run --config /etc/flexgrid/flexgrid.toml
//! flexgridd simulate --demand 6 --cycles 10
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use flexgrid_broker::{Broker, CapabilitySet, ControlLoop};
use flexgrid_capability::{SimIntegration, SimSite, StaticRequirement};
use flexgrid_core::{BackendKind, ControllerConfig, MachineTypeConfig, StateTimeouts};
use flexgrid_events::EventBus;
use flexgrid_registry::RegistrySnapshot;

#[derive(Parser)]
#[command(name = "flexgridd", about = "FlexGrid elastic resource controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller against a configuration file.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = "flexgrid.toml")]
        config: PathBuf,
    },
    /// Run a bounded number of cycles against the built-in simulator.
    Simulate {
        /// Demand reported by the simulated batch system.
        #[arg(long, default_value = "4")]
        demand: f64,

        /// Number of reconciliation cycles to run.
        #[arg(long, default_value = "10")]
        cycles: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flexgridd=debug,flexgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(config).await,
        Command::Simulate { demand, cycles } => simulate(demand, cycles).await,
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = ControllerConfig::from_file(&config_path)?;
    info!(
        path = ?config_path,
        machine_types = config.machine_types.len(),
        "configuration loaded"
    );

    let capabilities = build_capabilities(&config)?;
    let bus = EventBus::default();
    log_events(&bus);

    let interval = Duration::from_secs(config.cycle_interval_secs);
    let snapshot_path = config.snapshot_path.clone();

    let mut broker = Broker::new(config, capabilities, bus)?;
    if let Some(path) = snapshot_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = RegistrySnapshot::open(&path)?;
        info!(path = ?path, "registry snapshot opened");
        broker = broker.with_snapshot(snapshot)?;
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut control = ControlLoop::new(broker);
    let loop_handle = tokio::spawn(async move {
        control.run(interval, shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;

    info!("FlexGrid controller stopped");
    Ok(())
}

/// Instantiate the configured backend variants. Backends are a closed
/// set; a kind that makes no sense for a slot is a configuration error.
fn build_capabilities(config: &ControllerConfig) -> anyhow::Result<CapabilitySet> {
    let mut capabilities = CapabilitySet::new();

    for (name, kind) in &config.sites {
        match kind {
            BackendKind::Sim => capabilities.add_site(Arc::new(SimSite::new(name.clone()))),
            other => anyhow::bail!("site backend {name}: unsupported kind {other:?}"),
        }
    }
    for (name, kind) in &config.integrations {
        match kind {
            BackendKind::Sim => {
                capabilities.add_integration(Arc::new(SimIntegration::new(name.clone())))
            }
            other => anyhow::bail!("integration backend {name}: unsupported kind {other:?}"),
        }
    }
    for (name, kind) in &config.requirements {
        match kind {
            BackendKind::Static { demand } => capabilities.add_requirement(Arc::new(
                StaticRequirement::new(name.clone(), demand.clone()),
            )),
            other => anyhow::bail!("requirement backend {name}: unsupported kind {other:?}"),
        }
    }

    Ok(capabilities)
}

/// Mirror every bus event into the log stream.
fn log_events(bus: &EventBus) {
    bus.subscribe(
        None,
        Box::new(|event| {
            info!(
                kind = ?event.kind,
                machine = event.machine_id.as_deref().unwrap_or("-"),
                detail = %event.detail,
                "event"
            );
            Ok(())
        }),
    );
}

async fn simulate(demand: f64, cycles: u32) -> anyhow::Result<()> {
    info!(demand, cycles, "simulate mode");

    let config = ControllerConfig {
        cycle_interval_secs: 1,
        capability_timeout_secs: 5,
        snapshot_path: None,
        machine_types: BTreeMap::from([(
            "sim-worker".to_string(),
            MachineTypeConfig {
                site: "sim-site".to_string(),
                integration: "sim-batch".to_string(),
                requirements: vec!["sim-demand".to_string()],
                max_in_flight: 10,
                timeouts: StateTimeouts::default(),
            },
        )]),
        sites: BTreeMap::new(),
        integrations: BTreeMap::new(),
        requirements: BTreeMap::new(),
    };

    let mut capabilities = CapabilitySet::new();
    capabilities.add_site(Arc::new(SimSite::new("sim-site")));
    capabilities.add_integration(Arc::new(SimIntegration::new("sim-batch")));
    capabilities.add_requirement(Arc::new(StaticRequirement::new(
        "sim-demand",
        BTreeMap::from([("sim-worker".to_string(), demand)]),
    )));

    let bus = EventBus::default();
    log_events(&bus);

    let mut broker = Broker::new(config, capabilities, bus)?;
    for cycle in 1..=cycles {
        let report = broker.run_cycle().await?;
        info!(cycle, ?report, "cycle complete");
    }

    for machine in broker.registry().iter() {
        info!(
            id = %machine.id,
            state = %machine.state,
            site_id = machine.site_id.as_deref().unwrap_or("-"),
            "final machine"
        );
    }
    Ok(())
}
