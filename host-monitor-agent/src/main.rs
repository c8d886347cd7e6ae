//! Host Monitor - host metrics agent for Home Assistant
//!
//! Samples CPU, memory, disk, network, load, uptime and temperature readings
//! on a per-metric schedule and reports them either through the Home
//! Assistant REST states API or as MQTT Discovery sensors.

mod config;
mod error;
mod formatter;
mod metrics;
mod monitor;
mod report;
mod scheduler;

use anyhow::{Context, Result};
use clap::Parser;
use config::AppConfig;
use error::ErrorLog;
use metrics::SysinfoSource;
use monitor::Monitor;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "host-monitor", version, about = "Report host metrics to Home Assistant")]
struct Cli {
    /// Directory holding config.toml and error.log
    #[arg(long, env = "HOST_MONITOR_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,host_monitor=info")),
        )
        .with_target(false)
        .init();
}

/// Clear `running` on SIGINT or SIGTERM.
fn spawn_signal_listener(running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, finishing current tick");
        running.store(false, Ordering::Release);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only Ctrl+C will stop the agent");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run(cli: Cli) -> Result<()> {
    let config_dir = config::resolve_config_dir(cli.config_dir);
    let error_log = ErrorLog::new(config::error_log_path(&config_dir));
    info!(config_dir = %config_dir.display(), "starting host monitor v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(&config_dir, &error_log)
        .await
        .context("Failed to load configuration")?;
    info!(mode = ?config.report_mode, "configuration loaded");

    let mut monitor = Monitor::new(config, Box::new(SysinfoSource::new()), error_log);
    spawn_signal_listener(monitor.run_flag());

    if let Err(e) = monitor.initialize().await {
        monitor.shutdown().await;
        return Err(e).context("Failed to initialize monitor");
    }

    monitor.run().await;
    monitor.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {
            info!("host monitor exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
