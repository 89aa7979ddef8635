//! Outbound command payloads
//!
//! Commands are JSON objects published to the printer's request topic.
//! Sequence ids only need to be unique per client; a process-wide counter
//! is plenty.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

/// Identity reported in emergency-stop commands
const COMMAND_USER_ID: &str = "PrintCam";

static SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_sequence_id() -> String {
    SEQUENCE.fetch_add(1, Ordering::Relaxed).to_string()
}

/// Ask the printer to publish a full status dump.
pub fn pushall() -> Value {
    json!({
        "pushing": {
            "sequence_id": next_sequence_id(),
            "command": "pushall"
        }
    })
}

/// Emergency stop via the firmware M112 handler.
pub fn emergency_stop() -> Value {
    gcode_line("M112")
}

/// Run a single G-code line.
pub fn gcode_line(gcode: &str) -> Value {
    json!({
        "print": {
            "sequence_id": next_sequence_id(),
            "command": "gcode_line",
            "param": gcode,
            "user_id": COMMAND_USER_ID
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pushall_shape() {
        let cmd = pushall();
        assert_eq!(cmd["pushing"]["command"].as_str(), Some("pushall"));
        assert!(cmd["pushing"]["sequence_id"].is_string());
    }

    #[test]
    fn test_emergency_stop_shape() {
        let cmd = emergency_stop();
        assert_eq!(cmd["print"]["command"].as_str(), Some("gcode_line"));
        assert_eq!(cmd["print"]["param"].as_str(), Some("M112"));
        assert_eq!(cmd["print"]["user_id"].as_str(), Some("PrintCam"));
    }

    #[test]
    fn test_sequence_ids_advance() {
        let a = gcode_line("G28");
        let b = gcode_line("G28");
        assert_ne!(
            a["print"]["sequence_id"].as_str(),
            b["print"]["sequence_id"].as_str()
        );
    }
}
