#[macro_use]
extern crate log;

use std::{path::PathBuf, process};

use clap::Parser;
use servman::{error::Result, registry::ServiceRegistry, settings::Settings};
use simple_logger::SimpleLogger;
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Single-host supervisor for a fleet of locally deployed services
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the global settings file
    #[arg(long, default_value = "config.properties")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let _ = SimpleLogger::new().init();
    log_panics::init();

    if let Err(err) = run().await {
        error!("{err}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::try_parse()?;
    let settings = Settings::load(&args.config).await?;

    let shutdown_token = CancellationToken::new();
    let registry = ServiceRegistry::new(settings, shutdown_token.clone());

    // The self service must exist before anything else so all later logging
    // has a destination
    registry.load_self_service().await?;
    registry.reconcile().await;

    let shutdown_signal = setup_signal_watchers(shutdown_token.clone())?;
    info!("Supervisor started");

    let _ = shutdown_signal.await;
    info!("Shutting down");

    shutdown_token.cancel();
    registry.shutdown().await;

    info!("Goodbye");
    Ok(())
}

fn setup_signal_watchers(shutdown_token: CancellationToken) -> Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let shutdown_signal_task = tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            },
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating shutdown...");
            },
            _ = shutdown_token.cancelled() => {
                info!("Received shutdown command, initiating shutdown...");
            }
        }
    });

    Ok(shutdown_signal_task)
}
