//! Report payload parsing
//!
//! Printers publish incremental JSON reports; most messages carry only the
//! fields that changed. The parser therefore produces a [`StatusUpdate`]
//! delta rather than a full snapshot, leaving absent fields untouched in
//! the aggregator's cache.

use serde_json::Value;

use crate::status::{PrinterState, StatusUpdate};

/// Parse a raw report payload into a status delta.
///
/// Returns `None` when the payload is not JSON or carries no `print`
/// object (`system`, `info` and `mc_print` messages are ignored).
pub fn parse_report(payload: &[u8]) -> Option<StatusUpdate> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let print = value.get("print")?;

    let mut update = StatusUpdate::default();

    let nozzle_actual = field_f64(print, "nozzle_temper");
    let nozzle_target = field_f64(print, "nozzle_target_temper");
    // A lone nozzle zero is a known sensor glitch in partial reports; only
    // trust it when the same message carries the target too.
    update.nozzle_actual = match (nozzle_actual, nozzle_target) {
        (Some(actual), None) if actual == 0.0 => None,
        (actual, _) => actual,
    };
    update.nozzle_target = nozzle_target;
    update.bed_actual = field_f64(print, "bed_temper");
    update.bed_target = field_f64(print, "bed_target_temper");
    update.chamber_actual = field_f64(print, "chamber_temper");
    update.chamber_target = field_f64(print, "chamber_target_temper");

    update.progress_percent = field_f64(print, "mc_percent");
    // Remaining time is reported in minutes; saturate rather than trust the
    // payload to stay in range.
    update.remaining_secs = print
        .get("mc_remaining_time")
        .and_then(Value::as_u64)
        .map(|min| min.saturating_mul(60));
    update.layer_current = print
        .get("layer_num")
        .and_then(Value::as_u64)
        .map(|n| n as u32);
    update.layer_total = print
        .get("total_layer_num")
        .and_then(Value::as_u64)
        .map(|n| n as u32);

    let error_code = print.get("print_error").and_then(Value::as_u64);
    update.state = if error_code.is_some_and(|code| code != 0) {
        Some(PrinterState::Error)
    } else {
        print
            .get("gcode_state")
            .and_then(Value::as_str)
            .and_then(PrinterState::from_gcode_state)
    };

    Some(update)
}

/// Numeric field that some firmware revisions encode as a string.
fn field_f64(print: &Value, key: &str) -> Option<f64> {
    match print.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
