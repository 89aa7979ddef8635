//! PrintCam Gateway
//!
//! Main entry point for the gateway daemon.

use std::time::Duration;

use printcam_gateway::state::{AppConfig, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const OVERVIEW_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "printcam_gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PrintCam Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        data_dir = %config.data_dir.display(),
        ffmpeg = %config.ffmpeg_bin,
        relay_base_port = config.relay_base_port,
        cloud_api = %config.cloud_api_base,
        "Configuration loaded"
    );

    let state = AppState::init(config).await?;

    // One discovery pass at boot so the log shows what is reachable.
    let candidates = state.supervisor.scan().await;
    for candidate in &candidates {
        tracing::info!(
            ip = %candidate.ip,
            name = %candidate.display_name(),
            serial = candidate.serial.as_deref().unwrap_or("unknown"),
            lan_mode = candidate.lan_mode,
            "Discovered printer on the LAN"
        );
    }
    tracing::info!(count = candidates.len(), "Discovery pass finished");

    // Periodic status digest
    let overview_task = {
        let supervisor = state.supervisor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(OVERVIEW_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for entry in supervisor.overview().await {
                    tracing::info!(
                        printer_id = %entry.printer.id,
                        name = %entry.printer.name,
                        state = ?entry.status.as_ref().map(|s| s.state),
                        session = ?entry.session,
                        relay_port = entry.relay.as_ref().map(|r| r.port),
                        "Printer status"
                    );
                }
            }
        })
    };

    // Wait for shutdown signal
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm => {
            tracing::info!("Received SIGTERM shutdown signal");
        }
    }

    overview_task.abort();
    state.supervisor.shutdown().await;
    tracing::info!("Gateway stopped");

    Ok(())
}
