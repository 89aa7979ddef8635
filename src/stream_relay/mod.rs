//! StreamRelay - on-demand video relays
//!
//! ## Responsibilities
//!
//! - Allocate a relay port per streaming printer from a bounded pool
//! - Run one transcoder per relay and fan its output out to WS viewers
//! - Restart a dying transcoder a few times before declaring the relay dead
//! - Sweep relays nobody has watched for a while
//!
//! MJPEG sources never get a relay; viewers fetch those URLs directly.
//! Everything RTSP-shaped is transcoded to fragmented MP4.

pub mod port_pool;
pub mod transcoder;
mod types;
mod ws;

pub use port_pool::{PortPool, DEFAULT_BASE_PORT};
pub use types::{RelayInfo, StreamEndpoint, StreamSource};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::error::Result;

use transcoder::Transcoder;

/// Frames buffered per relay before slow viewers start skipping
const FRAME_CHANNEL_CAPACITY: usize = 64;
/// Transcoder liveness poll cadence
const LIVENESS_POLL: Duration = Duration::from_secs(1);
/// Consecutive restarts before a relay is declared failed
const MAX_RESTARTS: u32 = 3;
const RESTART_DELAY: Duration = Duration::from_secs(2);
/// Uptime after which the restart counter resets
const STABLE_UPTIME: Duration = Duration::from_secs(30);
/// How long a relay may sit at zero viewers before the sweep stops it
const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StreamRelayConfig {
    /// Transcoder binary; anything argument-compatible with ffmpeg works
    pub transcoder_program: String,
    pub base_port: u16,
    pub idle_grace: Duration,
}

impl Default for StreamRelayConfig {
    fn default() -> Self {
        Self {
            transcoder_program: "ffmpeg".to_string(),
            base_port: DEFAULT_BASE_PORT,
            idle_grace: DEFAULT_IDLE_GRACE,
        }
    }
}

enum RelayEvent {
    /// The monitor gave up on the transcoder
    Failed { printer_id: String },
}

/// Book-keeping for one running relay
struct Relay {
    printer_id: String,
    port: u16,
    viewers: Arc<AtomicUsize>,
    restart_count: Arc<AtomicU32>,
    created_at: DateTime<Utc>,
    ws: ws::WsServerHandle,
    monitor: JoinHandle<()>,
    monitor_stop: watch::Sender<bool>,
    /// When the viewer count last dropped to zero; sweep bookkeeping
    zero_since: Option<Instant>,
}

pub struct StreamRelayManager {
    config: StreamRelayConfig,
    pool: PortPool,
    relays: Mutex<HashMap<String, Relay>>,
    events: mpsc::UnboundedSender<RelayEvent>,
    background: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamRelayManager {
    pub fn new(config: StreamRelayConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            pool: PortPool::new(config.base_port),
            config,
            relays: Mutex::new(HashMap::new()),
            events: events_tx,
            background: std::sync::Mutex::new(None),
        });

        let task = tokio::spawn(Self::run_background(Arc::clone(&manager), events_rx));
        if let Ok(mut slot) = manager.background.lock() {
            *slot = Some(task);
        }
        manager
    }

    /// Ensure a relay (or direct endpoint) exists for a printer and return
    /// what the viewer should connect to.
    ///
    /// Failure leaves nothing behind: the transcoder is reaped and the port
    /// goes back to the pool.
    pub async fn start_stream(
        &self,
        printer_id: &str,
        source: StreamSource,
        preferred_port: Option<u16>,
    ) -> Result<StreamEndpoint> {
        let url = match source {
            // MJPEG is fine to hand out as-is, no relay involved.
            StreamSource::Mjpeg(url) => return Ok(StreamEndpoint::Direct { url }),
            StreamSource::Rtsp(url) => url,
        };

        let mut relays = self.relays.lock().await;
        if let Some(relay) = relays.get(printer_id) {
            debug!(printer_id = %printer_id, port = relay.port, "Relay already running");
            return Ok(StreamEndpoint::Relay { port: relay.port });
        }

        let (port, listener) = self.pool.allocate(preferred_port).await?;
        let (frames, _) = broadcast::channel::<Bytes>(FRAME_CHANNEL_CAPACITY);

        let mut transcoder =
            match Transcoder::launch(&self.config.transcoder_program, &url, frames.clone()) {
                Ok(t) => t,
                Err(e) => {
                    drop(listener);
                    self.pool.release(port).await;
                    return Err(e);
                }
            };
        if let Err(e) = transcoder.verify_startup().await {
            transcoder.shutdown().await;
            drop(listener);
            self.pool.release(port).await;
            return Err(e);
        }

        let viewers = Arc::new(AtomicUsize::new(0));
        let restart_count = Arc::new(AtomicU32::new(0));
        let ws = ws::serve(listener, frames.clone(), Arc::clone(&viewers));

        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = tokio::spawn(run_monitor(
            printer_id.to_string(),
            self.config.transcoder_program.clone(),
            url,
            transcoder,
            frames,
            Arc::clone(&restart_count),
            stop_rx,
            self.events.clone(),
        ));

        info!(printer_id = %printer_id, port = port, "Stream relay started");
        relays.insert(
            printer_id.to_string(),
            Relay {
                printer_id: printer_id.to_string(),
                port,
                viewers,
                restart_count,
                created_at: Utc::now(),
                ws,
                monitor,
                monitor_stop: stop_tx,
                zero_since: None,
            },
        );
        Ok(StreamEndpoint::Relay { port })
    }

    /// Stop a printer's relay. Returns false when none was running.
    pub async fn stop_stream(&self, printer_id: &str) -> bool {
        let relay = {
            let mut relays = self.relays.lock().await;
            relays.remove(printer_id)
        };
        match relay {
            Some(relay) => {
                self.teardown(relay).await;
                true
            }
            None => false,
        }
    }

    /// Current viewer count, None when no relay is running.
    pub async fn viewer_count(&self, printer_id: &str) -> Option<usize> {
        let relays = self.relays.lock().await;
        relays
            .get(printer_id)
            .map(|r| r.viewers.load(Ordering::SeqCst))
    }

    pub async fn list_relays(&self) -> Vec<RelayInfo> {
        let relays = self.relays.lock().await;
        let mut infos: Vec<RelayInfo> = relays
            .values()
            .map(|r| RelayInfo {
                printer_id: r.printer_id.clone(),
                port: r.port,
                viewer_count: r.viewers.load(Ordering::SeqCst),
                restart_count: r.restart_count.load(Ordering::SeqCst),
                created_at: r.created_at,
            })
            .collect();
        infos.sort_by(|a, b| a.printer_id.cmp(&b.printer_id));
        infos
    }

    /// Tear down every relay. Used at process shutdown.
    pub async fn shutdown_all(&self) {
        if let Ok(mut slot) = self.background.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        let drained: Vec<Relay> = {
            let mut relays = self.relays.lock().await;
            relays.drain().map(|(_, relay)| relay).collect()
        };
        for relay in drained {
            self.teardown(relay).await;
        }
    }

    /// Monitor stop, transcoder exit, WS close, port release; in that
    /// order, so the port only returns to the pool once both users of it
    /// are gone.
    async fn teardown(&self, relay: Relay) {
        let _ = relay.monitor_stop.send(true);
        if let Err(e) = relay.monitor.await {
            if !e.is_cancelled() {
                warn!(printer_id = %relay.printer_id, error = %e, "Relay monitor task failed");
            }
        }
        relay.ws.stop().await;
        self.pool.release(relay.port).await;
        info!(printer_id = %relay.printer_id, port = relay.port, "Stream relay stopped");
    }

    async fn run_background(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        let mut sweep = interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = sweep.tick() => self.sweep_idle().await,
                event = events.recv() => match event {
                    Some(RelayEvent::Failed { printer_id }) => {
                        warn!(printer_id = %printer_id, "Relay failed, tearing down");
                        self.stop_stream(&printer_id).await;
                    }
                    None => break,
                },
            }
        }
    }

    /// Stop relays whose viewer count has been zero for the whole grace
    /// period.
    async fn sweep_idle(&self) {
        let expired: Vec<String> = {
            let mut relays = self.relays.lock().await;
            let mut expired = Vec::new();
            for relay in relays.values_mut() {
                if relay.viewers.load(Ordering::SeqCst) > 0 {
                    relay.zero_since = None;
                    continue;
                }
                let since = *relay.zero_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.config.idle_grace {
                    expired.push(relay.printer_id.clone());
                }
            }
            expired
        };

        for printer_id in expired {
            info!(printer_id = %printer_id, "Stopping idle relay");
            self.stop_stream(&printer_id).await;
        }
    }
}

/// Per-relay supervisor loop: poll liveness, restart on death, give up
/// after too many consecutive failures.
#[allow(clippy::too_many_arguments)]
async fn run_monitor(
    printer_id: String,
    program: String,
    url: String,
    mut transcoder: Transcoder,
    frames: broadcast::Sender<Bytes>,
    restart_count: Arc<AtomicU32>,
    mut stop: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let mut consecutive = 0u32;
    let mut last_start = Instant::now();
    let mut ticker = interval(LIVENESS_POLL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if transcoder.is_running() {
                    if consecutive > 0 && last_start.elapsed() >= STABLE_UPTIME {
                        debug!(printer_id = %printer_id, "Transcoder stable, restart budget reset");
                        consecutive = 0;
                    }
                    continue;
                }

                let stderr = transcoder.stderr_tail();
                warn!(
                    printer_id = %printer_id,
                    consecutive = consecutive,
                    stderr = %stderr,
                    "Transcoder exited"
                );

                if consecutive >= MAX_RESTARTS {
                    error!(printer_id = %printer_id, "Transcoder restart budget exhausted");
                    let _ = events.send(RelayEvent::Failed { printer_id });
                    transcoder.shutdown().await;
                    break;
                }
                consecutive += 1;
                restart_count.fetch_add(1, Ordering::SeqCst);

                tokio::select! {
                    _ = sleep(RESTART_DELAY) => {}
                    _ = stop.changed() => {
                        transcoder.shutdown().await;
                        break;
                    }
                }

                info!(printer_id = %printer_id, attempt = consecutive, "Restarting transcoder");
                match Transcoder::launch(&program, &url, frames.clone()) {
                    Ok(fresh) => {
                        let old = std::mem::replace(&mut transcoder, fresh);
                        old.shutdown().await;
                        last_start = Instant::now();
                    }
                    Err(e) => {
                        // Next tick sees the dead child and burns another
                        // attempt.
                        error!(printer_id = %printer_id, error = %e, "Transcoder relaunch failed");
                    }
                }
            }
            _ = stop.changed() => {
                transcoder.shutdown().await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn fake_transcoder(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("fake-ffmpeg");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        file.set_permissions(perms).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn manager_with(program: String, base_port: u16) -> Arc<StreamRelayManager> {
        StreamRelayManager::new(StreamRelayConfig {
            transcoder_program: program,
            base_port,
            idle_grace: DEFAULT_IDLE_GRACE,
        })
    }

    #[tokio::test]
    async fn test_mjpeg_short_circuits_to_direct_url() {
        let manager = manager_with("ffmpeg".to_string(), 29400);
        let endpoint = manager
            .start_stream(
                "printer_a",
                StreamSource::classify("http://10.0.0.8:8080/?action=stream"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            endpoint,
            StreamEndpoint::Direct {
                url: "http://10.0.0.8:8080/?action=stream".to_string()
            }
        );
        assert!(manager.list_relays().await.is_empty());
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_start_stop_releases_port() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_transcoder(&dir, "exec tail -f /dev/null");
        let manager = manager_with(program, 29500);

        let endpoint = manager
            .start_stream("printer_a", StreamSource::Rtsp("rtsp://x".into()), None)
            .await
            .unwrap();
        assert_eq!(endpoint, StreamEndpoint::Relay { port: 29500 });
        assert_eq!(manager.pool.allocated_count().await, 1);

        // Idempotent second start returns the same endpoint.
        let again = manager
            .start_stream("printer_a", StreamSource::Rtsp("rtsp://x".into()), None)
            .await
            .unwrap();
        assert_eq!(again, endpoint);

        assert!(manager.stop_stream("printer_a").await);
        assert!(!manager.stop_stream("printer_a").await);
        assert_eq!(manager.pool.allocated_count().await, 0);
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_startup_failure_leaks_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_transcoder(&dir, "echo 'bad input' >&2; exit 1");
        let manager = manager_with(program, 29600);

        let err = manager
            .start_stream("printer_a", StreamSource::Rtsp("rtsp://x".into()), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad input"));
        assert_eq!(manager.pool.allocated_count().await, 0);
        assert!(manager.list_relays().await.is_empty());
        manager.shutdown_all().await;
    }
}
