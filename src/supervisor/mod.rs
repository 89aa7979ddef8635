//! Supervisor - session and relay orchestration
//!
//! ## Responsibilities
//!
//! - Load the printer inventory at startup and run the matching session
//!   per printer (local MQTT, shared cloud, OctoPrint broker)
//! - Route add/remove, emergency-stop and stream start/stop to the right
//!   subsystem
//! - Own every session handle and tear the whole plane down cleanly on
//!   process shutdown
//!
//! Cloud printers whose stored token fails revalidation stay registered
//! and show up offline until the operator signs in again.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bambu_cloud::{CloudSession, LiveStream, LoginOutcome};
use crate::bambu_local::{LocalMqttSession, LocalSessionConfig};
use crate::discovery::{self, PrinterCandidate};
use crate::error::{Error, Result};
use crate::notifier::{build_sinks, NotificationDispatcher, NotifierConfigRepository};
use crate::octoprint::{OctoPrintSession, OctoPrintSessionConfig};
use crate::printer_store::{NewPrinter, Printer, PrinterKind, PrinterStore};
use crate::session::SessionState;
use crate::state::AppConfig;
use crate::status::{PrinterStatus, StatusAggregator};
use crate::stream_relay::{
    RelayInfo, StreamEndpoint, StreamRelayConfig, StreamRelayManager, StreamSource,
};
use crate::{bambu_local, octoprint};

/// Everything known about one printer, for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct PrinterOverview {
    pub printer: Printer,
    pub status: Option<PrinterStatus>,
    /// `None` for printers without a telemetry session (plain MJPEG cams)
    pub session: Option<SessionState>,
    pub relay: Option<RelayInfo>,
}

enum PrinterSession {
    Local(LocalMqttSession),
    /// Attached to the shared cloud session
    Cloud,
    OctoPrint(OctoPrintSession),
    /// No telemetry channel
    Passive,
}

pub struct Supervisor {
    config: AppConfig,
    store: Arc<PrinterStore>,
    aggregator: Arc<StatusAggregator>,
    cloud: Arc<CloudSession>,
    relays: Arc<StreamRelayManager>,
    sessions: Mutex<HashMap<String, PrinterSession>>,
    dispatcher: Mutex<Option<NotificationDispatcher>>,
}

impl Supervisor {
    /// Bring the whole plane up: stores, cloud account, notification
    /// dispatcher, then one session per stored printer.
    pub async fn start(config: AppConfig) -> Result<Arc<Self>> {
        let aggregator = StatusAggregator::new();
        let store = PrinterStore::open(config.printers_dir()).await?;
        let cloud = CloudSession::open(
            &config.cloud_api_base,
            &config.cloud_mqtt_host,
            config.cloud_dir(),
            Arc::clone(&aggregator),
        )
        .await?;
        let relays = StreamRelayManager::new(StreamRelayConfig {
            transcoder_program: config.ffmpeg_bin.clone(),
            base_port: config.relay_base_port,
            ..StreamRelayConfig::default()
        });

        let notifier_config = NotifierConfigRepository::new(config.notifications_dir())
            .load_or_init()
            .await?;
        let sinks = build_sinks(&notifier_config)?;
        let dispatcher = NotificationDispatcher::spawn(&aggregator, Arc::clone(&store), sinks);

        let supervisor = Arc::new(Self {
            config,
            store,
            aggregator,
            cloud,
            relays,
            sessions: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(Some(dispatcher)),
        });

        supervisor.bootstrap_cloud().await;
        supervisor.start_stored_sessions().await;
        info!("Supervisor started");
        Ok(supervisor)
    }

    pub fn store(&self) -> Arc<PrinterStore> {
        Arc::clone(&self.store)
    }

    pub fn aggregator(&self) -> Arc<StatusAggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn cloud(&self) -> Arc<CloudSession> {
        Arc::clone(&self.cloud)
    }

    pub fn relays(&self) -> Arc<StreamRelayManager> {
        Arc::clone(&self.relays)
    }

    /// Revalidate any stored cloud token, then try an environment-driven
    /// login for headless installs. Network trouble keeps the stored
    /// account; only an explicit rejection clears it.
    async fn bootstrap_cloud(&self) {
        match self.cloud.revalidate().await {
            Ok(true) => {
                info!("Cloud account ready");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Cloud token check unreachable, keeping stored credentials");
                return;
            }
        }

        let (Some(email), Some(password)) =
            (&self.config.cloud_email, &self.config.cloud_password)
        else {
            return;
        };
        let outcome = match &self.config.cloud_verification_code {
            Some(code) => self.cloud.login_with_code(email, code).await,
            None => self.cloud.login(email, password).await,
        };
        match outcome {
            Ok(LoginOutcome::LoggedIn { .. }) => info!("Cloud account signed in"),
            Ok(LoginOutcome::NeedsVerification) => {
                warn!("Cloud login wants the emailed code; set BAMBU_CODE and restart")
            }
            Err(e) => warn!(error = %e, "Cloud login failed"),
        }
    }

    async fn start_stored_sessions(&self) {
        let printers = self.store.list().await;
        info!(count = printers.len(), "Starting sessions for stored printers");
        for printer in printers {
            if let Err(e) = self.start_session(&printer).await {
                warn!(printer_id = %printer.id, error = %e, "Session not started, printer stays offline");
                self.aggregator.register(&printer.id).await;
            }
        }
    }

    async fn start_session(&self, printer: &Printer) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&printer.id) {
            return Ok(());
        }

        let session = match printer.kind {
            PrinterKind::LocalBambu => {
                let access_code = printer.secret.clone().ok_or_else(|| {
                    Error::Validation("local printer has no access code".into())
                })?;
                let config = LocalSessionConfig {
                    printer_id: printer.id.clone(),
                    host: printer.address.clone(),
                    port: printer.mqtt_port.unwrap_or(bambu_local::DEFAULT_MQTT_PORT),
                    access_code,
                    serial: printer.serial.clone(),
                };
                PrinterSession::Local(LocalMqttSession::spawn(
                    config,
                    Arc::clone(&self.store),
                    Arc::clone(&self.aggregator),
                ))
            }
            PrinterKind::CloudBambu => {
                self.cloud.attach(&printer.id, &printer.address).await?;
                PrinterSession::Cloud
            }
            PrinterKind::Octoprint => {
                let config = OctoPrintSessionConfig {
                    printer_id: printer.id.clone(),
                    host: printer.address.clone(),
                    port: printer.mqtt_port.unwrap_or(octoprint::DEFAULT_MQTT_PORT),
                    api_url: printer.api_url.clone(),
                    api_key: printer.secret.clone(),
                };
                PrinterSession::OctoPrint(OctoPrintSession::spawn(
                    config,
                    Arc::clone(&self.aggregator),
                )?)
            }
            PrinterKind::GenericMjpeg => {
                self.aggregator.register(&printer.id).await;
                PrinterSession::Passive
            }
        };
        sessions.insert(printer.id.clone(), session);
        Ok(())
    }

    /// Persist a printer and start its session. A session that cannot start
    /// yet (say, no cloud account) leaves the printer stored and offline.
    pub async fn add_printer(&self, new: NewPrinter) -> Result<Printer> {
        let printer = self.store.add(new).await?;
        if let Err(e) = self.start_session(&printer).await {
            warn!(printer_id = %printer.id, error = %e, "Printer stored but session not started");
            self.aggregator.register(&printer.id).await;
        }
        Ok(printer)
    }

    /// Stop everything derived from a printer, then delete its document.
    pub async fn remove_printer(&self, id: &str) -> Result<Printer> {
        let session = self.sessions.lock().await.remove(id);
        if let Some(session) = session {
            self.stop_session(id, session).await;
        }
        self.relays.stop_stream(id).await;
        self.aggregator.remove(id).await;
        let printer = self.store.remove(id).await?;
        info!(printer_id = %id, "Printer removed");
        Ok(printer)
    }

    async fn stop_session(&self, printer_id: &str, session: PrinterSession) {
        match session {
            PrinterSession::Local(s) => s.disconnect().await,
            PrinterSession::Cloud => self.cloud.detach(printer_id).await,
            PrinterSession::OctoPrint(s) => s.disconnect().await,
            PrinterSession::Passive => {}
        }
    }

    /// Route the emergency stop to the printer's control channel.
    pub async fn emergency_stop(&self, id: &str) -> Result<()> {
        let printer = self
            .store
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("printer {}", id)))?;

        let sessions = self.sessions.lock().await;
        match sessions.get(id) {
            Some(PrinterSession::Local(session)) => session.emergency_stop().await,
            Some(PrinterSession::Cloud) => {
                if self.cloud.emergency_stop(&printer.address).await {
                    Ok(())
                } else {
                    Err(Error::Mqtt("cloud MQTT session not attached".into()))
                }
            }
            Some(PrinterSession::OctoPrint(session)) => session.emergency_stop().await,
            Some(PrinterSession::Passive) => {
                Err(Error::Validation("printer has no control channel".into()))
            }
            None => Err(Error::Validation("printer has no active session".into())),
        }
    }

    /// Resolve the printer's video source and hand it to the relay plane.
    pub async fn start_stream(&self, id: &str) -> Result<StreamEndpoint> {
        let printer = self
            .store
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("printer {}", id)))?;

        let url = match printer.kind {
            PrinterKind::CloudBambu => self.cloud_stream_url(&printer).await?,
            _ => printer
                .stream_url()
                .ok_or_else(|| Error::Validation("printer has no stream source".into()))?,
        };
        self.relays
            .start_stream(&printer.id, StreamSource::classify(&url), printer.relay_port)
            .await
    }

    pub async fn stop_stream(&self, id: &str) -> bool {
        self.relays.stop_stream(id).await
    }

    /// Cloud feeds go through the vendor live endpoint per viewing session.
    /// The device access code comes from the printer document or, failing
    /// that, the account's device list.
    async fn cloud_stream_url(&self, printer: &Printer) -> Result<String> {
        let access_code = match &printer.secret {
            Some(code) if !code.is_empty() => code.clone(),
            _ => self.lookup_device_access_code(&printer.address).await?,
        };
        match self.cloud.live_stream(&printer.address, &access_code).await? {
            LiveStream::Available { url, .. } => Ok(url),
            LiveStream::Unavailable { reason } => Err(Error::Network(format!(
                "live stream unavailable: {}",
                reason
            ))),
        }
    }

    async fn lookup_device_access_code(&self, device_id: &str) -> Result<String> {
        let devices = self.cloud.list_devices().await?;
        devices
            .into_iter()
            .find(|d| d.dev_id == device_id)
            .map(|d| d.dev_access_code)
            .filter(|code| !code.is_empty())
            .ok_or_else(|| Error::NotFound(format!("device {} not in cloud account", device_id)))
    }

    /// LAN scan passthrough.
    pub async fn scan(&self) -> Vec<PrinterCandidate> {
        discovery::scan().await
    }

    /// Assemble the full status picture for every stored printer.
    pub async fn overview(&self) -> Vec<PrinterOverview> {
        let printers = self.store.list().await;
        let snapshots = self.aggregator.snapshot_all().await;
        let relays: HashMap<String, RelayInfo> = self
            .relays
            .list_relays()
            .await
            .into_iter()
            .map(|r| (r.printer_id.clone(), r))
            .collect();

        let sessions = self.sessions.lock().await;
        let mut overviews = Vec::with_capacity(printers.len());
        for printer in printers {
            let session = match sessions.get(&printer.id) {
                Some(PrinterSession::Local(s)) => Some(s.state().await),
                Some(PrinterSession::Cloud) => Some(self.cloud.state().await),
                Some(PrinterSession::OctoPrint(s)) => Some(s.state().await),
                Some(PrinterSession::Passive) | None => None,
            };
            overviews.push(PrinterOverview {
                status: snapshots.get(&printer.id).cloned(),
                session,
                relay: relays.get(&printer.id).cloned(),
                printer,
            });
        }
        overviews
    }

    /// Tear everything down: sessions, the shared cloud session, relays and
    /// their transcoders, then the dispatcher.
    pub async fn shutdown(&self) {
        info!("Supervisor shutting down");
        let sessions: Vec<(String, PrinterSession)> =
            self.sessions.lock().await.drain().collect();
        for (printer_id, session) in sessions {
            self.stop_session(&printer_id, session).await;
        }
        self.cloud.shutdown().await;
        self.relays.shutdown_all().await;
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            dispatcher.shutdown().await;
        }
        info!("Supervisor stopped");
    }
}
