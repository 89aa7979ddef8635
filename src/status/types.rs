//! Printer status data types
//!
//! Live snapshot structures shared by the session modules and the
//! aggregator. Snapshots are never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Print job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterState {
    /// No session or the session reports the device unreachable
    Offline,
    /// Device reachable, no job running
    Idle,
    /// Job in progress
    Printing,
    /// Job paused
    Paused,
    /// Job completed successfully
    Finished,
    /// Job failed
    Failed,
    /// Job cancelled by the user
    Cancelled,
    /// Device-reported error
    Error,
}

impl PrinterState {
    /// Parse the vendor `gcode_state` enumeration.
    ///
    /// Unknown values return `None` so a garbled field never clobbers the
    /// cached state.
    pub fn from_gcode_state(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "IDLE" => Some(Self::Idle),
            "RUNNING" | "PREPARE" | "SLICING" => Some(Self::Printing),
            "PAUSE" => Some(Self::Paused),
            "FINISH" => Some(Self::Finished),
            "FAILED" => Some(Self::Failed),
            "STOPPED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for PrinterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrinterState::Offline => "offline",
            PrinterState::Idle => "idle",
            PrinterState::Printing => "printing",
            PrinterState::Paused => "paused",
            PrinterState::Finished => "finished",
            PrinterState::Failed => "failed",
            PrinterState::Cancelled => "cancelled",
            PrinterState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Actual/target pair for one heater
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TempReading {
    pub actual: f64,
    pub target: f64,
}

/// Heater readings
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Temps {
    pub nozzle: TempReading,
    pub bed: TempReading,
    pub chamber: TempReading,
}

/// Live per-printer snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterStatus {
    pub state: PrinterState,
    pub temps: Temps,
    /// Job completion percent, clamped to [0,100]
    pub progress_percent: f64,
    /// Remaining print time in seconds
    pub remaining_secs: u64,
    pub layer_current: u32,
    pub layer_total: u32,
    pub last_update: DateTime<Utc>,
}

impl Default for PrinterStatus {
    fn default() -> Self {
        Self {
            state: PrinterState::Offline,
            temps: Temps::default(),
            progress_percent: 0.0,
            remaining_secs: 0,
            layer_current: 0,
            layer_total: 0,
            last_update: Utc::now(),
        }
    }
}

/// Partial status update emitted by a session.
///
/// `None` fields leave the cached snapshot untouched; only fields the
/// originating message actually carried are `Some`. A message asserting an
/// explicit zero arrives as `Some(0.0)` and does overwrite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub state: Option<PrinterState>,
    pub nozzle_actual: Option<f64>,
    pub nozzle_target: Option<f64>,
    pub bed_actual: Option<f64>,
    pub bed_target: Option<f64>,
    pub chamber_actual: Option<f64>,
    pub chamber_target: Option<f64>,
    pub progress_percent: Option<f64>,
    pub remaining_secs: Option<u64>,
    pub layer_current: Option<u32>,
    pub layer_total: Option<u32>,
}

impl StatusUpdate {
    /// An update with only a state change
    pub fn state(state: PrinterState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// True when any carried temperature is non-zero
    pub fn has_live_temp(&self) -> bool {
        [
            self.nozzle_actual,
            self.bed_actual,
            self.chamber_actual,
        ]
        .iter()
        .any(|t| t.is_some_and(|v| v > 0.0))
    }

    /// Merge into a snapshot. Returns true when anything changed.
    pub fn apply_to(&self, status: &mut PrinterStatus) -> bool {
        let mut changed = false;

        if let Some(state) = self.state {
            if status.state != state {
                status.state = state;
                changed = true;
            }
        }

        let mut set_f64 = |slot: &mut f64, value: Option<f64>| {
            if let Some(v) = value {
                if (*slot - v).abs() > f64::EPSILON {
                    *slot = v;
                    changed = true;
                }
            }
        };
        set_f64(&mut status.temps.nozzle.actual, self.nozzle_actual);
        set_f64(&mut status.temps.nozzle.target, self.nozzle_target);
        set_f64(&mut status.temps.bed.actual, self.bed_actual);
        set_f64(&mut status.temps.bed.target, self.bed_target);
        set_f64(&mut status.temps.chamber.actual, self.chamber_actual);
        set_f64(&mut status.temps.chamber.target, self.chamber_target);
        set_f64(
            &mut status.progress_percent,
            self.progress_percent.map(|p| p.clamp(0.0, 100.0)),
        );

        if let Some(secs) = self.remaining_secs {
            if status.remaining_secs != secs {
                status.remaining_secs = secs;
                changed = true;
            }
        }
        if let Some(layer) = self.layer_current {
            if status.layer_current != layer {
                status.layer_current = layer;
                changed = true;
            }
        }
        if let Some(total) = self.layer_total {
            if status.layer_total != total {
                status.layer_total = total;
                changed = true;
            }
        }

        changed
    }
}

/// State transition observed by the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub printer_id: String,
    pub prev_state: PrinterState,
    pub next_state: PrinterState,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcode_state_mapping() {
        assert_eq!(
            PrinterState::from_gcode_state("RUNNING"),
            Some(PrinterState::Printing)
        );
        assert_eq!(
            PrinterState::from_gcode_state("finish"),
            Some(PrinterState::Finished)
        );
        assert_eq!(
            PrinterState::from_gcode_state("STOPPED"),
            Some(PrinterState::Cancelled)
        );
        assert_eq!(PrinterState::from_gcode_state("WARBLE"), None);
    }

    #[test]
    fn test_absent_fields_keep_prior_values() {
        let mut status = PrinterStatus {
            state: PrinterState::Printing,
            ..PrinterStatus::default()
        };
        status.temps.nozzle.actual = 210.0;
        status.temps.bed.actual = 60.0;

        let update = StatusUpdate {
            progress_percent: Some(42.0),
            ..StatusUpdate::default()
        };
        let changed = update.apply_to(&mut status);

        assert!(changed);
        assert_eq!(status.progress_percent, 42.0);
        assert_eq!(status.temps.nozzle.actual, 210.0);
        assert_eq!(status.temps.bed.actual, 60.0);
        assert_eq!(status.state, PrinterState::Printing);
    }

    #[test]
    fn test_explicit_zero_overwrites() {
        let mut status = PrinterStatus::default();
        status.temps.bed.actual = 60.0;

        let update = StatusUpdate {
            bed_actual: Some(0.0),
            ..StatusUpdate::default()
        };
        assert!(update.apply_to(&mut status));
        assert_eq!(status.temps.bed.actual, 0.0);
    }

    #[test]
    fn test_progress_clamped() {
        let mut status = PrinterStatus::default();

        let update = StatusUpdate {
            progress_percent: Some(250.0),
            ..StatusUpdate::default()
        };
        update.apply_to(&mut status);
        assert_eq!(status.progress_percent, 100.0);

        let update = StatusUpdate {
            progress_percent: Some(-5.0),
            ..StatusUpdate::default()
        };
        update.apply_to(&mut status);
        assert_eq!(status.progress_percent, 0.0);
    }

    #[test]
    fn test_unchanged_update_reports_no_change() {
        let mut status = PrinterStatus::default();
        status.temps.nozzle.actual = 210.0;

        let update = StatusUpdate {
            nozzle_actual: Some(210.0),
            ..StatusUpdate::default()
        };
        assert!(!update.apply_to(&mut status));
    }

    #[test]
    fn test_has_live_temp() {
        let update = StatusUpdate {
            nozzle_actual: Some(0.0),
            ..StatusUpdate::default()
        };
        assert!(!update.has_live_temp());

        let update = StatusUpdate {
            chamber_actual: Some(31.5),
            ..StatusUpdate::default()
        };
        assert!(update.has_live_temp());
    }
}
