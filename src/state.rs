//! Application state
//!
//! Holds the runtime configuration and shared service handles

use std::path::PathBuf;
use std::sync::Arc;

use crate::bambu_cloud::{CloudSession, DEFAULT_API_BASE, DEFAULT_MQTT_HOST};
use crate::error::Result;
use crate::printer_store::PrinterStore;
use crate::status::StatusAggregator;
use crate::stream_relay::{StreamRelayManager, DEFAULT_BASE_PORT};
use crate::supervisor::Supervisor;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root of the persisted data tree
    pub data_dir: PathBuf,
    /// Transcoder binary
    pub ffmpeg_bin: String,
    /// First port of the relay pool
    pub relay_base_port: u16,
    /// Cloud REST base URL
    pub cloud_api_base: String,
    /// Shared cloud MQTT broker host
    pub cloud_mqtt_host: String,
    /// Account email for headless cloud sign-in
    pub cloud_email: Option<String>,
    pub cloud_password: Option<String>,
    /// Emailed verification code, when the last login asked for one
    pub cloud_verification_code: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            ffmpeg_bin: std::env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()),
            relay_base_port: std::env::var("RELAY_BASE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_BASE_PORT),
            cloud_api_base: std::env::var("CLOUD_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            cloud_mqtt_host: std::env::var("CLOUD_MQTT_HOST")
                .unwrap_or_else(|_| DEFAULT_MQTT_HOST.to_string()),
            cloud_email: std::env::var("BAMBU_EMAIL").ok(),
            cloud_password: std::env::var("BAMBU_PASSWORD").ok(),
            cloud_verification_code: std::env::var("BAMBU_CODE").ok(),
        }
    }
}

impl AppConfig {
    pub fn printers_dir(&self) -> PathBuf {
        self.data_dir.join("printers")
    }

    pub fn cloud_dir(&self) -> PathBuf {
        self.data_dir.join("bambu-cloud")
    }

    pub fn notifications_dir(&self) -> PathBuf {
        self.data_dir.join("notifications")
    }
}

/// Application state shared across surfaces
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Printer inventory
    pub store: Arc<PrinterStore>,
    /// Live status and transition stream
    pub aggregator: Arc<StatusAggregator>,
    /// Shared cloud account and MQTT session
    pub cloud: Arc<CloudSession>,
    /// Stream relay plane
    pub relays: Arc<StreamRelayManager>,
    /// Session orchestration
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    /// Boot every service and assemble the shared state.
    pub async fn init(config: AppConfig) -> Result<Self> {
        let supervisor = Supervisor::start(config.clone()).await?;
        Ok(Self {
            store: supervisor.store(),
            aggregator: supervisor.aggregator(),
            cloud: supervisor.cloud(),
            relays: supervisor.relays(),
            supervisor,
            config,
        })
    }
}
