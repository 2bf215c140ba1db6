//! # docketd
//!
//! Loads settings, wires the stream hub into the server, and serves until
//! SIGINT or SIGTERM.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use docket_events::{MemoryWatermarks, SqliteWatermarks, StreamHub, WatermarkStore};
use docket_server::admission::AdmissionChain;
use docket_server::config::ServerConfig;
use docket_server::server::DocketServer;
use docket_server::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use docket_settings::DocketSettings;
use tokio::sync::broadcast::error::RecvError;

use crate::signals::wait_for_signal;

/// Resumable push-event streaming server.
#[derive(Parser, Debug)]
#[command(name = "docketd", version, about = "Resumable push-event streaming server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server.
    Serve(ServeArgs),
    /// Print the effective settings as JSON and exit.
    Settings(SettingsArgs),
}

#[derive(Args, Debug)]
struct SettingsArgs {
    /// Settings file (defaults to `~/.docket/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Settings file (defaults to `~/.docket/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Serve the canned mock stream to sessions that do not ask for a mode.
    #[arg(long)]
    mock: bool,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

fn load(path: Option<&Path>) -> Result<DocketSettings> {
    let path = path.map_or_else(docket_settings::settings_path, Path::to_path_buf);
    docket_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

/// Fold command-line overrides into loaded settings.
fn apply_args(settings: &mut DocketSettings, args: &ServeArgs) {
    if let Some(host) = &args.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if args.mock {
        settings.stream.mock_mode = true;
    }
    if let Some(level) = &args.log_level {
        settings.logging.level.clone_from(level);
    }
    if args.json_logs {
        settings.logging.json = true;
    }
}

fn watermark_store(settings: &DocketSettings) -> Result<Arc<dyn WatermarkStore>> {
    match &settings.stream.watermark_db {
        Some(path) => {
            let store = SqliteWatermarks::open(Path::new(path))
                .with_context(|| format!("Failed to open watermark store {path}"))?;
            tracing::info!(path = %path, "sequence watermarks persisted to sqlite");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("sequence watermarks held in memory");
            Ok(Arc::new(MemoryWatermarks::new()))
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut settings = load(args.settings.as_deref())?;
    apply_args(&mut settings, &args);
    settings.validate().context("Invalid settings")?;

    docket_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = docket_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let config = ServerConfig::from_settings(&settings);
    let hub = Arc::new(StreamHub::new(config.stream, watermark_store(&settings)?));
    let admission = AdmissionChain::from_settings(&settings.admission);
    tracing::info!(
        stages = ?admission.stages(),
        default_mode = config.default_mode.as_str(),
        "admission pipeline ready"
    );

    // Producers subscribe to resync requests to re-issue snapshots; the
    // daemon alone only records them.
    let mut resyncs = hub.resync_requests();
    let resync_log = tokio::spawn(async move {
        loop {
            match resyncs.recv().await {
                Ok(req) => tracing::info!(
                    session_id = %req.session_id,
                    connection_id = %req.connection_id,
                    last_acked = req.last_acked,
                    resync_sequence = req.resync_sequence,
                    "resync requested"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "resync log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let server = DocketServer::new(config, admission, hub).with_metrics(metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("docketd listening on http://{addr}");

    wait_for_signal().await.context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down...");
    let drained = server.shutdown(Some(DEFAULT_SHUTDOWN_TIMEOUT)).await;
    if !drained {
        tracing::warn!("connections still open after shutdown timeout");
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    resync_log.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Settings(args) => {
            let settings = load(args.settings.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

mod signals {
    //! Process signal handling.

    /// Resolve on SIGINT, or SIGTERM on unix.
    pub async fn wait_for_signal() -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term = signal(SignalKind::terminate())?;
            tokio::select! {
                res = tokio::signal::ctrl_c() => res,
                _ = term.recv() => Ok(()),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await
        }
    }
}
