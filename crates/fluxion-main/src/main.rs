// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

mod config;

use anyhow::{Context, Result};
use fluxion_core::{EventRecorder, RecorderConfig, ScheduledTask, Services, SystemClock};
use fluxion_ha::{HaError, HomeAssistantClient, HomeAssistantSession};
use fluxion_storage::{DocumentStore, TimeSeriesStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SYNC_LOG_CLEANUP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // Handle command line arguments
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    if args.len() > 1 {
        match args[1].as_str() {
            "--help" | "-h" => {
                println!("FluxION Energy Recorder");
                println!("Version: {VERSION}");
                println!();
                println!("Usage: fluxion-recorder [OPTIONS] [CONFIG]");
                println!();
                println!("Arguments:");
                println!("  [CONFIG]      Path to a TOML or JSON config file (default: config.toml)");
                println!();
                println!("Options:");
                println!("  -h, --help    Print this help message");
                println!("  -v, --version Print version");
                return Ok(());
            }
            "--version" | "-v" => {
                println!("{VERSION}");
                return Ok(());
            }
            path => config_path = Some(PathBuf::from(path)),
        }
    }

    let (config, source) = AppConfig::load(config_path.as_deref())?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🚀 Starting FluxION Energy Recorder v{VERSION}");
    info!("✅ Loaded configuration from {source}");

    run(config).await
}

async fn run(config: AppConfig) -> Result<()> {
    let client_config = config.client_config()?;
    let document_path = config.storage.document_path();
    let timeseries_path = config.storage.timeseries_path();

    info!("📋 Configuration Summary:");
    info!("   Hub: {}", client_config.url);
    info!("   Document store: {}", document_path.display());
    info!("   Time-series store: {}", timeseries_path.display());
    info!(
        "   Heartbeat: {}s (idle after {}s), backfill every {}s",
        config.recorder.heartbeat_interval_secs,
        config.recorder.idle_threshold_secs,
        config.recorder.backfill_interval_secs
    );
    info!(
        "   Auto-track new entities: {}",
        config.recorder.auto_track_new_entities
    );

    let registry = Arc::new(
        DocumentStore::open(&document_path).context("Failed to open entity registry")?,
    );
    let sink = Arc::new(
        TimeSeriesStore::open(&timeseries_path).context("Failed to open time-series store")?,
    );

    info!("🏠 Connecting to Home Assistant...");
    let client = HomeAssistantClient::new(client_config);
    tokio::select! {
        result = connect(&client) => result?,
        () = shutdown_signal() => {
            info!("Shutdown requested before the hub became reachable");
            client.close();
            return Ok(());
        }
    }

    let services = Services {
        hub: Arc::new(HomeAssistantSession::new(client.clone())),
        registry: registry.clone(),
        sink,
        clock: Arc::new(SystemClock),
    };
    let recorder = EventRecorder::new(services, RecorderConfig::from(&config));
    recorder.start().await.context("Failed to start recorder")?;

    let cleanup = spawn_sync_log_cleanup(registry, config.storage.sync_log_retention_days);

    shutdown_signal().await;
    info!("🛑 Shutdown signal received");

    cleanup.stop(Duration::from_secs(5)).await;
    recorder.stop().await;
    client.close();

    let snapshot = recorder.get_state();
    info!(
        events = snapshot.event_count,
        errors = snapshot.error_count,
        "👋 Recorder stopped"
    );
    Ok(())
}

/// Connect once, then fall back to the client's backoff loop.
/// Rejected credentials are fatal either way.
async fn connect(client: &HomeAssistantClient) -> Result<()> {
    match client.connect().await {
        Ok(()) => {}
        Err(e @ HaError::Auth(_)) => {
            return Err(e).context("Home Assistant rejected the access token");
        }
        Err(e) => {
            warn!("⚠️  Initial connection failed: {e}, retrying with backoff");
            client
                .reconnect()
                .await
                .context("Failed to connect to Home Assistant")?;
        }
    }
    info!("✅ Connected to Home Assistant");
    Ok(())
}

fn spawn_sync_log_cleanup(registry: Arc<DocumentStore>, retention_days: u32) -> ScheduledTask {
    // Startup pass, the scheduled loop first fires a day later
    if let Err(e) = registry.cleanup_sync_logs(retention_days) {
        error!(error = %e, "Initial sync log cleanup failed");
    }

    ScheduledTask::spawn("sync-log-cleanup", SYNC_LOG_CLEANUP_PERIOD, move || {
        let registry = registry.clone();
        async move { registry.cleanup_sync_logs(retention_days).map(|_| ()) }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
