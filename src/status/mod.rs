//! Status aggregator
//!
//! ## Responsibilities
//! - Hold the live in-memory snapshot for every managed printer
//! - Merge partial session updates into the cached snapshots
//! - Detect state transitions and fan them out over a broadcast channel
//! - Serve point-in-time snapshot reads to callers
//!
//! Snapshots live only in memory. Removing a printer drops its entry;
//! a session outage marks the entry offline instead.

pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

pub use types::{PrinterState, PrinterStatus, StatusUpdate, TempReading, Temps, TransitionEvent};

/// Capacity of the transition fan-out channel
const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// Shared live-status cache with transition fan-out
pub struct StatusAggregator {
    snapshots: RwLock<HashMap<String, PrinterStatus>>,
    transitions: broadcast::Sender<TransitionEvent>,
}

impl StatusAggregator {
    pub fn new() -> Arc<Self> {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Arc::new(Self {
            snapshots: RwLock::new(HashMap::new()),
            transitions,
        })
    }

    /// Subscribe to state transitions. Events published before the call are
    /// not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.transitions.subscribe()
    }

    /// Ensure a snapshot slot exists for a printer, starting offline.
    pub async fn register(&self, printer_id: &str) {
        let mut snapshots = self.snapshots.write().await;
        snapshots
            .entry(printer_id.to_string())
            .or_insert_with(PrinterStatus::default);
    }

    /// Merge a partial update into a printer's snapshot.
    ///
    /// Creates the snapshot on first contact. An update that carries live
    /// heater readings but no state lifts an offline printer to idle, since
    /// a device reporting temperatures is evidently reachable.
    pub async fn apply_update(&self, printer_id: &str, update: StatusUpdate) {
        if update.is_empty() {
            return;
        }

        let mut snapshots = self.snapshots.write().await;
        let status = snapshots
            .entry(printer_id.to_string())
            .or_insert_with(PrinterStatus::default);

        let prev_state = status.state;

        let mut update = update;
        if update.state.is_none()
            && status.state == PrinterState::Offline
            && update.has_live_temp()
        {
            update.state = Some(PrinterState::Idle);
        }

        let changed = update.apply_to(status);
        if changed {
            status.last_update = monotonic_now(status.last_update);
        }
        let next_state = status.state;
        let at = status.last_update;

        if next_state != prev_state {
            info!(
                printer_id = %printer_id,
                prev = %prev_state,
                next = %next_state,
                "Printer state transition"
            );
            // Emitted while the write guard is still held so the event order
            // matches the mutation order; the send is synchronous and only
            // fails when nobody is subscribed.
            let _ = self.transitions.send(TransitionEvent {
                printer_id: printer_id.to_string(),
                prev_state,
                next_state,
                at,
            });
        } else if changed {
            debug!(printer_id = %printer_id, "Status updated");
        }
    }

    /// Mark a printer offline, e.g. when its session loses the connection.
    /// No-op when the printer is unknown or already offline.
    pub async fn mark_offline(&self, printer_id: &str) {
        {
            let snapshots = self.snapshots.read().await;
            if !snapshots.contains_key(printer_id) {
                return;
            }
        }
        self.apply_update(printer_id, StatusUpdate::state(PrinterState::Offline))
            .await;
    }

    /// Drop a printer's snapshot entirely.
    pub async fn remove(&self, printer_id: &str) {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.remove(printer_id).is_some() {
            debug!(printer_id = %printer_id, "Snapshot removed");
        }
    }

    /// Point-in-time copy of one printer's snapshot
    pub async fn snapshot(&self, printer_id: &str) -> Option<PrinterStatus> {
        let snapshots = self.snapshots.read().await;
        snapshots.get(printer_id).cloned()
    }

    /// Point-in-time copy of every snapshot
    pub async fn snapshot_all(&self) -> HashMap<String, PrinterStatus> {
        let snapshots = self.snapshots.read().await;
        snapshots.clone()
    }
}

/// Per-printer timestamps never run backwards, even if the wall clock does.
fn monotonic_now(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev
    }
}
