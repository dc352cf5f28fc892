use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fleet_upgrade::cancel::{self, CancellationFlag};
use fleet_upgrade::cli::Cli;
use fleet_upgrade::constants::TITLE;
use fleet_upgrade::engine::Engine;
use fleet_upgrade::remote::SshDialer;
use fleet_upgrade::topology::Topology;

fn init_tracing(debug: bool, debug_log: &Path) -> Result<()> {
    let default_filter = if debug {
        "debug,fleet_upgrade=debug"
    } else {
        "info,fleet_upgrade=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let mut open_error = None;
    let file_layer = if debug {
        match OpenOptions::new().create(true).append(true).open(debug_log) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(err) => {
                open_error = Some(err);
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    if let Some(err) = open_error {
        tracing::warn!(path = %debug_log.display(), error = %err, "debug log unavailable");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, &cli.debug_log_path())?;
    tracing::info!("{TITLE}");

    let options = cli.run_options()?;
    let topology_path = cli.topology_path();
    let topology = Topology::load(&topology_path)?;
    tracing::info!(topology = %topology_path.display(), pid = std::process::id(), "loaded topology");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let flag = CancellationFlag::new();
        let watcher = tokio::spawn(cancel::watch_signals(flag.clone()));

        let engine_flag = flag.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut engine = Engine::new(topology, options, Arc::new(SshDialer), engine_flag);
            engine.run()
        })
        .await
        .context("engine task panicked");
        watcher.abort();

        outcome??;
        Ok::<(), anyhow::Error>(())
    })
}
