//! warpfleetd: the warpfleet rollout daemon.
//!
//! Opens the embedded object store and runs the upgrade group controller
//! against it until interrupted.
//!
//! # Usage
//!
//! ```text
//! warpfleetd run --config /etc/warpfleet/warpfleetd.toml
//! warpfleetd check-config --config /etc/warpfleet/warpfleetd.toml
//! ```

mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warpfleet_controller::{Controller, Reconciler};
use warpfleet_state::StateStore;

use crate::config::{DaemonConfig, LogConfig, Overrides};

#[derive(Parser)]
#[command(name = "warpfleetd", about = "warpfleet rollout daemon")]
struct Cli {
    /// Path to warpfleetd.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the object store (overrides store.path).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Concurrent reconciles (overrides controller.workers).
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until Ctrl-C.
    Run,
    /// Validate the configuration and print the effective values.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = Overrides {
        data_dir: cli.data_dir,
        workers: cli.workers,
    };
    let config = DaemonConfig::load(cli.config.as_deref(), &overrides)?;

    match cli.command {
        Command::Run => {
            init_tracing(&config.log)?;
            run(config).await
        }
        Command::CheckConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log.filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("warpfleet daemon starting");

    if let Some(dir) = config.store.path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let store = StateStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "state store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let events = store.subscribe();
    let reconciler = Reconciler::new(store.clone(), store, config.controller.clone());
    let controller = Controller::new(reconciler);
    let handle = tokio::spawn(controller.run(events, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    handle.await?;
    info!("warpfleet daemon stopped");
    Ok(())
}
