//! OctoPrintSession - OctoPrint printers via their MQTT plugin
//!
//! ## Responsibilities
//!
//! - One plain MQTT session per printer against the operator's broker
//! - Parse the plugin's temperature, progress and event topics into status
//!   updates
//! - Emergency stop over MQTT with an HTTP fallback against the OctoPrint
//!   REST API
//!
//! The plugin publishes temperatures both as bare numeric strings and as
//! JSON objects depending on its version; both shapes are handled.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::session::SessionState;
use crate::status::{PrinterState, StatusAggregator, StatusUpdate};

pub const DEFAULT_MQTT_PORT: u16 = 1883;
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const EVENT_CHANNEL_CAPACITY: usize = 100;
const ESTOP_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

const TOPIC_TEMPERATURE: &str = "octoPrint/temperature/#";
/// Matches both `octoPrint/progress` and its subtopics; plugin versions
/// disagree on whether progress lands on the bare topic.
const TOPIC_PROGRESS: &str = "octoPrint/progress/#";
const TOPIC_EVENT: &str = "octoPrint/event/#";
const TOPIC_ESTOP: &str = "octoPrint/command/emergency_stop";

#[derive(Debug, Clone)]
pub struct OctoPrintSessionConfig {
    pub printer_id: String,
    /// Broker host, not the printer itself
    pub host: String,
    pub port: u16,
    /// OctoPrint HTTP base for the emergency-stop fallback
    pub api_url: Option<String>,
    pub api_key: Option<String>,
}

pub struct OctoPrintSession {
    printer_id: String,
    client: AsyncClient,
    state: Arc<RwLock<SessionState>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    http: reqwest::Client,
    api_url: Option<String>,
    api_key: Option<String>,
}

impl OctoPrintSession {
    pub fn spawn(
        config: OctoPrintSessionConfig,
        aggregator: Arc<StatusAggregator>,
    ) -> Result<Self> {
        let client_id = format!("printcam_{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        let (client, event_loop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        let http = reqwest::Client::builder()
            .timeout(ESTOP_HTTP_TIMEOUT)
            .build()?;
        let state = Arc::new(RwLock::new(SessionState::Connecting));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let printer_id = config.printer_id.clone();
        let api_url = config.api_url.clone();
        let api_key = config.api_key.clone();
        let task = tokio::spawn(run_session(
            config,
            client.clone(),
            event_loop,
            Arc::clone(&state),
            aggregator,
            shutdown_rx,
        ));

        Ok(Self {
            printer_id,
            client,
            state,
            shutdown: shutdown_tx,
            task,
            http,
            api_url,
            api_key,
        })
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Emergency stop: publish M112 for the broker-side plugin, fall back
    /// to the OctoPrint REST API when the broker is unreachable.
    pub async fn emergency_stop(&self) -> Result<()> {
        let connected = matches!(
            *self.state.read().await,
            SessionState::Subscribed | SessionState::Active
        );
        if connected {
            match self
                .client
                .publish(TOPIC_ESTOP, QoS::AtMostOnce, false, "M112")
                .await
            {
                Ok(()) => {
                    info!(printer_id = %self.printer_id, "Emergency stop published");
                    return Ok(());
                }
                Err(e) => {
                    warn!(printer_id = %self.printer_id, error = %e, "MQTT emergency stop failed, trying REST");
                }
            }
        }
        self.rest_emergency_stop().await
    }

    async fn rest_emergency_stop(&self) -> Result<()> {
        let (api_url, api_key) = match (&self.api_url, &self.api_key) {
            (Some(url), Some(key)) => (url, key),
            _ => {
                return Err(Error::Validation(
                    "no OctoPrint API endpoint configured for emergency stop".into(),
                ))
            }
        };
        let url = format!("{}/api/printer/command", api_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header("X-Api-Key", api_key)
            .json(&serde_json::json!({ "commands": ["M112"] }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!(
                "emergency stop rejected with HTTP {}",
                status.as_u16()
            )));
        }
        info!(printer_id = %self.printer_id, "Emergency stop sent over REST");
        Ok(())
    }

    /// Synchronous teardown, mirroring the local session.
    pub async fn disconnect(self) {
        let _ = self.shutdown.send(true);
        let _ = self.client.disconnect().await;
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(printer_id = %self.printer_id, error = %e, "Session task failed");
            }
        }
        *self.state.write().await = SessionState::Closed;
        info!(printer_id = %self.printer_id, "OctoPrint session closed");
    }
}

async fn run_session(
    config: OctoPrintSessionConfig,
    client: AsyncClient,
    mut event_loop: rumqttc::EventLoop,
    state: Arc<RwLock<SessionState>>,
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
                    info!(printer_id = %printer_id, host = %config.host, "OctoPrint broker connected");
                    backoff.reset();
                    if subscribe_all(&client).await.is_ok() {
                        *state.write().await = SessionState::Subscribed;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(update) = parse_message(&publish.topic, &publish.payload) else {
                        debug!(printer_id = %printer_id, topic = %publish.topic, "Ignored publish");
                        continue;
                    };
                    *state.write().await = SessionState::Active;
                    aggregator.apply_update(&printer_id, update).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(printer_id = %printer_id, error = %e, "OctoPrint broker connection lost");
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
    debug!(printer_id = %printer_id, "OctoPrint session task exited");
}

async fn subscribe_all(client: &AsyncClient) -> Result<()> {
    for topic in [TOPIC_TEMPERATURE, TOPIC_PROGRESS, TOPIC_EVENT] {
        client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| Error::Mqtt(e.to_string()))?;
    }
    Ok(())
}

/// Route one plugin publish to the matching parser.
fn parse_message(topic: &str, payload: &[u8]) -> Option<StatusUpdate> {
    let text = std::str::from_utf8(payload).ok()?;
    if let Some(channel) = topic.strip_prefix("octoPrint/temperature/") {
        parse_temperature(channel, text)
    } else if topic == "octoPrint/progress" || topic.starts_with("octoPrint/progress/") {
        parse_progress(text)
    } else if let Some(event) = topic.strip_prefix("octoPrint/event/") {
        parse_event(event)
    } else {
        None
    }
}

/// Temperature payloads are either a bare numeric string or a JSON object
/// with `actual`/`target` (older plugins say `temperature`).
fn parse_temperature(channel: &str, text: &str) -> Option<StatusUpdate> {
    let (actual, target) = match text.trim().parse::<f64>() {
        Ok(v) => (Some(v), None),
        Err(_) => {
            let value: Value = serde_json::from_str(text).ok()?;
            let actual = value
                .get("actual")
                .or_else(|| value.get("temperature"))
                .and_then(Value::as_f64);
            let target = value.get("target").and_then(Value::as_f64);
            (actual, target)
        }
    };
    let actual = actual?;

    let mut update = StatusUpdate::default();
    match channel {
        "tool0" => {
            // Same glitch guard as the vendor parser: a lone zero with no
            // target is a sensor dropout, not a cooldown.
            if actual == 0.0 && target.is_none() {
                return None;
            }
            update.nozzle_actual = Some(actual);
            update.nozzle_target = target;
        }
        "bed" => {
            update.bed_actual = Some(actual);
            update.bed_target = target;
        }
        "chamber" => {
            update.chamber_actual = Some(actual);
            update.chamber_target = target;
        }
        _ => return None,
    }
    Some(update)
}

/// Progress payloads are a bare percentage or a JSON object with
/// `completion` (some plugin versions say `progress`).
fn parse_progress(text: &str) -> Option<StatusUpdate> {
    let percent = match text.trim().parse::<f64>() {
        Ok(v) => v,
        Err(_) => {
            let value: Value = serde_json::from_str(text).ok()?;
            value
                .get("completion")
                .or_else(|| value.get("progress"))
                .and_then(Value::as_f64)?
        }
    };
    Some(StatusUpdate {
        progress_percent: Some(percent),
        ..StatusUpdate::default()
    })
}

/// The event name is the topic suffix; payloads are ignored.
fn parse_event(event: &str) -> Option<StatusUpdate> {
    let state = match event {
        "PrintStarted" | "PrintResumed" => PrinterState::Printing,
        "PrintDone" => PrinterState::Finished,
        "PrintFailed" => PrinterState::Failed,
        "PrintPaused" => PrinterState::Paused,
        "PrintCancelled" => PrinterState::Cancelled,
        _ => return None,
    };
    Some(StatusUpdate::state(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_string_temperatures() {
        let update = parse_message("octoPrint/temperature/tool0", b"214.7").unwrap();
        assert_eq!(update.nozzle_actual, Some(214.7));
        assert_eq!(update.nozzle_target, None);

        let update = parse_message("octoPrint/temperature/bed", b"60").unwrap();
        assert_eq!(update.bed_actual, Some(60.0));
    }

    #[test]
    fn test_json_temperatures() {
        let update = parse_message(
            "octoPrint/temperature/bed",
            br#"{"_timestamp": 1700000000, "actual": 59.8, "target": 60.0}"#,
        )
        .unwrap();
        assert_eq!(update.bed_actual, Some(59.8));
        assert_eq!(update.bed_target, Some(60.0));

        let update = parse_message(
            "octoPrint/temperature/chamber",
            br#"{"temperature": 31.2}"#,
        )
        .unwrap();
        assert_eq!(update.chamber_actual, Some(31.2));
    }

    #[test]
    fn test_lone_zero_nozzle_dropped() {
        assert!(parse_message("octoPrint/temperature/tool0", b"0.0").is_none());
        // An explicit cooldown carries a target and is kept.
        let update = parse_message(
            "octoPrint/temperature/tool0",
            br#"{"actual": 0.0, "target": 0.0}"#,
        )
        .unwrap();
        assert_eq!(update.nozzle_actual, Some(0.0));
    }

    #[test]
    fn test_secondary_tools_ignored() {
        assert!(parse_message("octoPrint/temperature/tool1", b"180.0").is_none());
    }

    #[test]
    fn test_progress_both_shapes() {
        let update = parse_message("octoPrint/progress", b"42").unwrap();
        assert_eq!(update.progress_percent, Some(42.0));

        let update = parse_message(
            "octoPrint/progress/printing",
            br#"{"completion": 97.3, "printTime": 812}"#,
        )
        .unwrap();
        assert_eq!(update.progress_percent, Some(97.3));
    }

    #[test]
    fn test_event_mapping() {
        let cases = [
            ("PrintStarted", PrinterState::Printing),
            ("PrintDone", PrinterState::Finished),
            ("PrintFailed", PrinterState::Failed),
            ("PrintPaused", PrinterState::Paused),
            ("PrintResumed", PrinterState::Printing),
            ("PrintCancelled", PrinterState::Cancelled),
        ];
        for (event, expected) in cases {
            let topic = format!("octoPrint/event/{}", event);
            let update = parse_message(&topic, b"{}").unwrap();
            assert_eq!(update.state, Some(expected), "event {}", event);
        }
        assert!(parse_message("octoPrint/event/ClientOpened", b"{}").is_none());
    }

    #[test]
    fn test_unrelated_topics_ignored() {
        assert!(parse_message("octoPrint/mqtt", b"connected").is_none());
        assert!(parse_message("device/SER/report", b"{}").is_none());
    }
}
