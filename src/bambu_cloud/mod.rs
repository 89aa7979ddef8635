//! CloudSession - vendor cloud account and shared MQTT
//!
//! ## Responsibilities
//!
//! - Account login against the vendor REST API, including the emailed
//!   verification-code second step
//! - Persist and revalidate the access token across restarts
//! - One shared MQTT session multiplexing every cloud printer; per-device
//!   subscriptions are added and removed as printers attach and detach
//! - Device list and per-device live-stream lookup
//!
//! The shared session exists only while at least one printer is attached;
//! the last detach closes it.

mod api;
mod repository;
mod types;

pub use api::{CloudApi, DEFAULT_API_BASE};
pub use repository::CredentialsRepository;
pub use types::{CloudCredentials, CloudDevice, CloudRegion, LiveStream, LoginOutcome};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::bambu::{self, commands};
use crate::error::{Error, Result};
use crate::session::SessionState;
use crate::status::StatusAggregator;

pub const DEFAULT_MQTT_HOST: &str = "us.mqtt.bambulab.com";
const CLOUD_MQTT_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const EVENT_CHANNEL_CAPACITY: usize = 100;

pub struct CloudSession {
    api: CloudApi,
    repo: CredentialsRepository,
    mqtt_host: String,
    aggregator: Arc<StatusAggregator>,
    credentials: RwLock<Option<CloudCredentials>>,
    /// device-id -> printer-id, shared with the driver task
    attached: Arc<RwLock<HashMap<String, String>>>,
    mqtt: Mutex<Option<SharedMqtt>>,
}

impl CloudSession {
    /// Open the service against a credentials directory. Any stored account
    /// is loaded as-is; call [`revalidate`](Self::revalidate) before
    /// trusting its token.
    pub async fn open(
        api_base: impl Into<String>,
        mqtt_host: impl Into<String>,
        dir: impl AsRef<Path>,
        aggregator: Arc<StatusAggregator>,
    ) -> Result<Arc<Self>> {
        let api = CloudApi::new(api_base)?;
        let repo = CredentialsRepository::new(dir.as_ref());
        let credentials = repo.load().await?;
        if let Some(creds) = &credentials {
            info!(email = %creds.email, user_id = %creds.user_id, "Loaded stored cloud account");
        }
        Ok(Arc::new(Self {
            api,
            repo,
            mqtt_host: mqtt_host.into(),
            aggregator,
            credentials: RwLock::new(credentials),
            attached: Arc::new(RwLock::new(HashMap::new())),
            mqtt: Mutex::new(None),
        }))
    }

    /// Check the stored token against the account endpoint. A refused token
    /// clears the account, in memory and on disk. Transport errors leave
    /// the account alone so an offline start does not log the operator out.
    pub async fn revalidate(&self) -> Result<bool> {
        let token = match self.credentials.read().await.as_ref() {
            Some(creds) => creds.token.clone(),
            None => return Ok(false),
        };
        if self.api.validate_token(&token).await? {
            debug!("Stored cloud token accepted");
            return Ok(true);
        }
        warn!("Stored cloud token rejected, clearing account");
        *self.credentials.write().await = None;
        self.repo.delete().await?;
        Ok(false)
    }

    /// First login step. `NeedsVerification` means a code was emailed and
    /// the caller should retry via [`login_with_code`](Self::login_with_code).
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        match self.api.login(email, password).await? {
            LoginOutcome::LoggedIn { token } => self.store_account(email, token).await,
            outcome => Ok(outcome),
        }
    }

    pub async fn login_with_code(&self, email: &str, code: &str) -> Result<LoginOutcome> {
        match self.api.login_with_code(email, code).await? {
            LoginOutcome::LoggedIn { token } => self.store_account(email, token).await,
            outcome => Ok(outcome),
        }
    }

    async fn store_account(&self, email: &str, token: String) -> Result<LoginOutcome> {
        let user_id = self.api.get_user_id(&token).await?;
        let credentials = CloudCredentials {
            email: email.to_string(),
            token: token.clone(),
            user_id: user_id.clone(),
            connected: true,
            region: CloudRegion::default(),
            updated_at: Utc::now(),
        };
        self.repo.save(&credentials).await?;
        *self.credentials.write().await = Some(credentials);
        info!(email = %email, user_id = %user_id, "Cloud login complete");
        Ok(LoginOutcome::LoggedIn { token })
    }

    /// Snapshot of the stored account, if any.
    pub async fn credentials(&self) -> Option<CloudCredentials> {
        self.credentials.read().await.clone()
    }

    pub async fn list_devices(&self) -> Result<Vec<CloudDevice>> {
        let token = self.require_token().await?;
        self.api.list_devices(&token).await
    }

    /// Live camera feed lookup for one device.
    pub async fn live_stream(&self, device_id: &str, access_code: &str) -> Result<LiveStream> {
        let token = self.require_token().await?;
        self.api.live_stream(&token, device_id, access_code).await
    }

    async fn require_token(&self) -> Result<String> {
        self.credentials
            .read()
            .await
            .as_ref()
            .map(|c| c.token.clone())
            .ok_or_else(|| Error::Auth("no cloud account on file".into()))
    }

    /// Start feeding a cloud printer's reports into the aggregator. Brings
    /// the shared MQTT session up on first use.
    pub async fn attach(&self, printer_id: &str, device_id: &str) -> Result<()> {
        self.ensure_mqtt().await?;
        self.attached
            .write()
            .await
            .insert(device_id.to_string(), printer_id.to_string());
        self.aggregator.register(printer_id).await;

        let guard = self.mqtt.lock().await;
        if let Some(handle) = guard.as_ref() {
            subscribe_device(&handle.client, device_id).await;
        }
        info!(printer_id = %printer_id, device_id = %device_id, "Cloud printer attached");
        Ok(())
    }

    /// Stop feeding a printer. The shared session closes once nothing is
    /// attached anymore.
    pub async fn detach(&self, printer_id: &str) {
        let device_id = {
            let mut attached = self.attached.write().await;
            let found = attached
                .iter()
                .find(|(_, pid)| pid.as_str() == printer_id)
                .map(|(dev, _)| dev.clone());
            if let Some(dev) = &found {
                attached.remove(dev);
            }
            found
        };
        let Some(device_id) = device_id else {
            return;
        };

        let mut guard = self.mqtt.lock().await;
        if let Some(handle) = guard.as_ref() {
            let _ = handle.client.unsubscribe(bambu::report_topic(&device_id)).await;
            let _ = handle
                .client
                .unsubscribe(bambu::request_topic(&device_id))
                .await;
        }
        if self.attached.read().await.is_empty() {
            if let Some(handle) = guard.take() {
                handle.close().await;
                info!("Cloud MQTT session closed, no printers attached");
            }
        }
        drop(guard);

        self.aggregator.mark_offline(printer_id).await;
        info!(printer_id = %printer_id, device_id = %device_id, "Cloud printer detached");
    }

    /// Fire the firmware emergency stop at a device. Returns false when the
    /// shared session is not up; never errors.
    pub async fn emergency_stop(&self, device_id: &str) -> bool {
        let guard = self.mqtt.lock().await;
        let Some(handle) = guard.as_ref() else {
            warn!(device_id = %device_id, "Emergency stop skipped, cloud MQTT not attached");
            return false;
        };
        let payload = commands::emergency_stop().to_string();
        match handle
            .client
            .publish(bambu::request_topic(device_id), QoS::AtMostOnce, false, payload)
            .await
        {
            Ok(()) => {
                info!(device_id = %device_id, "Emergency stop published");
                true
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Emergency stop publish failed");
                false
            }
        }
    }

    pub async fn attached_count(&self) -> usize {
        self.attached.read().await.len()
    }

    /// Shared-session state; `Disconnected` when no session exists.
    pub async fn state(&self) -> SessionState {
        match self.mqtt.lock().await.as_ref() {
            Some(handle) => *handle.state.read().await,
            None => SessionState::Disconnected,
        }
    }

    /// Close the shared session without touching the stored account.
    pub async fn shutdown(&self) {
        let printer_ids: Vec<String> = self.attached.write().await.drain().map(|(_, pid)| pid).collect();
        if let Some(handle) = self.mqtt.lock().await.take() {
            handle.close().await;
        }
        for printer_id in printer_ids {
            self.aggregator.mark_offline(&printer_id).await;
        }
        debug!("Cloud session shut down");
    }

    async fn ensure_mqtt(&self) -> Result<()> {
        let mut guard = self.mqtt.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let creds = self
            .credentials
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Auth("no cloud account on file".into()))?;

        let client_id = format!("bbl_client_{}_{}", creds.user_id, Utc::now().timestamp());
        let mut options = MqttOptions::new(client_id, self.mqtt_host.clone(), CLOUD_MQTT_PORT);
        options.set_credentials(format!("u_{}", creds.user_id), &creds.token);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_transport(bambu::insecure_tls_transport());

        let (client, event_loop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(RwLock::new(SessionState::Connecting));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_shared_session(
            client.clone(),
            event_loop,
            Arc::clone(&self.attached),
            Arc::clone(&self.aggregator),
            Arc::clone(&state),
            shutdown_rx,
        ));
        info!(host = %self.mqtt_host, user_id = %creds.user_id, "Cloud MQTT session starting");
        *guard = Some(SharedMqtt {
            client,
            state,
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }
}

struct SharedMqtt {
    client: AsyncClient,
    state: Arc<RwLock<SessionState>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SharedMqtt {
    async fn close(self) {
        let _ = self.shutdown.send(true);
        let _ = self.client.disconnect().await;
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Cloud MQTT task failed");
            }
        }
    }
}

async fn run_shared_session(
    client: AsyncClient,
    mut event_loop: rumqttc::EventLoop,
    attached: Arc<RwLock<HashMap<String, String>>>,
    aggregator: Arc<StatusAggregator>,
    state: Arc<RwLock<SessionState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::default();

    loop {
        tokio::select! {
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Cloud MQTT connected");
                    backoff.reset();
                    let devices: Vec<String> = attached.read().await.keys().cloned().collect();
                    for device_id in &devices {
                        subscribe_device(&client, device_id).await;
                    }
                    *state.write().await = SessionState::Subscribed;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(serial) = bambu::serial_from_topic(&publish.topic) else {
                        continue;
                    };
                    let Some(update) = bambu::report::parse_report(&publish.payload) else {
                        continue;
                    };
                    let printer_id = attached.read().await.get(serial).cloned();
                    if let Some(printer_id) = printer_id {
                        *state.write().await = SessionState::Active;
                        aggregator.apply_update(&printer_id, update).await;
                    } else {
                        debug!(serial = %serial, "Report for unattached device ignored");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Cloud MQTT connection lost");
                    *state.write().await = SessionState::Disconnected;
                    for printer_id in attached.read().await.values() {
                        aggregator.mark_offline(printer_id).await;
                    }
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
    debug!("Cloud MQTT task exited");
}

/// Subscribe a device's report and request topics and solicit a full dump.
/// Failures are logged only; the reconnect path retries the whole set.
async fn subscribe_device(client: &AsyncClient, device_id: &str) {
    for topic in [
        bambu::report_topic(device_id),
        bambu::request_topic(device_id),
    ] {
        if let Err(e) = client.subscribe(topic, QoS::AtMostOnce).await {
            warn!(device_id = %device_id, error = %e, "Cloud subscribe failed");
            return;
        }
    }
    if let Err(e) = client
        .publish(
            bambu::request_topic(device_id),
            QoS::AtMostOnce,
            false,
            commands::pushall().to_string(),
        )
        .await
    {
        warn!(device_id = %device_id, error = %e, "pushall publish failed");
    }
}
