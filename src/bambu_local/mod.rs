//! LocalMQTTSession - LAN BambuLab printers
//!
//! ## Responsibilities
//!
//! - One TLS MQTT session per local printer, authenticated with the LAN
//!   access code
//! - Feed parsed reports into the status aggregator
//! - Learn the device serial from the first report and write it back to
//!   the inventory
//! - Reconnect forever with backoff until explicitly disconnected
//!
//! The printers present self-signed certificates, so verification is off
//! for this transport. Lost messages are not recovered; the next full
//! report heals the snapshot.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::bambu::{self, commands};
use crate::error::{Error, Result};
use crate::printer_store::PrinterStore;
use crate::session::SessionState;
use crate::status::{StatusAggregator, StatusUpdate};

pub const DEFAULT_MQTT_PORT: u16 = 8883;
const MQTT_USERNAME: &str = "bblp";
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct LocalSessionConfig {
    pub printer_id: String,
    pub host: String,
    pub port: u16,
    pub access_code: String,
    /// Known serial, if any; otherwise learned from the first report
    pub serial: Option<String>,
}

pub struct LocalMqttSession {
    printer_id: String,
    client: AsyncClient,
    serial: Arc<RwLock<Option<String>>>,
    state: Arc<RwLock<SessionState>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LocalMqttSession {
    /// Start the session. Connection and all retries happen in the
    /// background; the snapshot stays offline until the first report.
    pub fn spawn(
        config: LocalSessionConfig,
        store: Arc<PrinterStore>,
        aggregator: Arc<StatusAggregator>,
    ) -> Self {
        let client_id = format!("printcam_{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_credentials(MQTT_USERNAME, &config.access_code);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_transport(bambu::insecure_tls_transport());

        let (client, event_loop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        let printer_id = config.printer_id.clone();
        let serial = Arc::new(RwLock::new(config.serial.clone()));
        let state = Arc::new(RwLock::new(SessionState::Connecting));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_session(
            config,
            client.clone(),
            event_loop,
            Arc::clone(&serial),
            Arc::clone(&state),
            store,
            aggregator,
            shutdown_rx,
        ));

        Self {
            printer_id,
            client,
            serial,
            state,
            shutdown: shutdown_tx,
            task,
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Fire the firmware emergency stop. Fails when the serial is not yet
    /// known or the publish cannot be queued.
    pub async fn emergency_stop(&self) -> Result<()> {
        let serial = self.serial.read().await.clone().ok_or_else(|| {
            Error::Validation("printer serial not known yet, cannot target request topic".into())
        })?;
        let topic = bambu::request_topic(&serial);
        self.client
            .publish(
                topic,
                QoS::AtMostOnce,
                false,
                commands::emergency_stop().to_string(),
            )
            .await
            .map_err(|e| Error::Mqtt(e.to_string()))?;
        info!(printer_id = %self.printer_id, "Emergency stop published");
        Ok(())
    }

    /// Synchronous teardown: stop the event loop, close the connection and
    /// wait for the driver task to exit.
    pub async fn disconnect(self) {
        let _ = self.shutdown.send(true);
        let _ = self.client.disconnect().await;
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(printer_id = %self.printer_id, error = %e, "Session task failed");
            }
        }
        *self.state.write().await = SessionState::Closed;
        info!(printer_id = %self.printer_id, "Local session closed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    config: LocalSessionConfig,
    client: AsyncClient,
    mut event_loop: rumqttc::EventLoop,
    serial: Arc<RwLock<Option<String>>>,
    state: Arc<RwLock<SessionState>>,
    store: Arc<PrinterStore>,
    aggregator: Arc<StatusAggregator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let printer_id = config.printer_id.clone();
    aggregator.register(&printer_id).await;
    let mut backoff = Backoff::default();

    loop {
        tokio::select! {
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(printer_id = %printer_id, host = %config.host, "Local MQTT connected");
                    backoff.reset();
                    *state.write().await = SessionState::Connecting;
                    if subscribe_all(&client).await.is_ok() {
                        *state.write().await = SessionState::Subscribed;
                    }
                    // Solicit a full dump so the snapshot fills immediately.
                    if let Some(serial) = serial.read().await.clone() {
                        publish_pushall(&client, &serial, &printer_id).await;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some((topic_serial, update)) =
                        interpret_publish(&publish.topic, &publish.payload)
                    else {
                        debug!(printer_id = %printer_id, topic = %publish.topic, "Ignored publish");
                        continue;
                    };

                    let learned = {
                        let mut serial = serial.write().await;
                        if serial.as_deref() != Some(topic_serial.as_str()) {
                            *serial = Some(topic_serial.clone());
                            true
                        } else {
                            false
                        }
                    };
                    if learned {
                        if let Err(e) = store.update_serial(&printer_id, &topic_serial).await {
                            warn!(printer_id = %printer_id, error = %e, "Serial write-back failed");
                        }
                        publish_pushall(&client, &topic_serial, &printer_id).await;
                    }

                    *state.write().await = SessionState::Active;
                    aggregator.apply_update(&printer_id, update).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(printer_id = %printer_id, error = %e, "Local MQTT connection lost");
                    *state.write().await = SessionState::Disconnected;
                    aggregator.mark_offline(&printer_id).await;
                    if !backoff.sleep(&mut shutdown).await {
                        break;
                    }
                    *state.write().await = SessionState::Connecting;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    *state.write().await = SessionState::Closed;
    aggregator.mark_offline(&printer_id).await;
    debug!(printer_id = %printer_id, "Local session task exited");
}

async fn subscribe_all(client: &AsyncClient) -> Result<()> {
    for suffix in ["report", "status", "push"] {
        client
            .subscribe(format!("device/+/{}", suffix), QoS::AtMostOnce)
            .await
            .map_err(|e| Error::Mqtt(e.to_string()))?;
    }
    Ok(())
}

async fn publish_pushall(client: &AsyncClient, serial: &str, printer_id: &str) {
    let topic = bambu::request_topic(serial);
    if let Err(e) = client
        .publish(topic, QoS::AtMostOnce, false, commands::pushall().to_string())
        .await
    {
        warn!(printer_id = %printer_id, error = %e, "pushall publish failed");
    } else {
        debug!(printer_id = %printer_id, "pushall requested");
    }
}

/// Map a report publish to (serial, status delta). Non-report topics and
/// unparseable payloads return `None`.
fn interpret_publish(topic: &str, payload: &[u8]) -> Option<(String, StatusUpdate)> {
    let serial = bambu::serial_from_topic(topic)?;
    let update = bambu::report::parse_report(payload)?;
    Some((serial.to_string(), update))
}
