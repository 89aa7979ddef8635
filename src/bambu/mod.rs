//! Shared BambuLab MQTT protocol pieces
//!
//! ## Responsibilities
//! - Parse `print` report payloads into partial status updates
//! - Build the JSON command payloads the printers accept
//! - Topic layout and TLS transport shared by the local and cloud sessions
//!
//! Both dialects speak the same topic scheme (`device/<serial>/report` in,
//! `device/<serial>/request` out) and the same command set; only broker,
//! credentials and client-id differ.

pub mod commands;
pub mod report;

use rumqttc::{TlsConfiguration, Transport};

/// Topic a printer publishes its status reports on
pub fn report_topic(serial: &str) -> String {
    format!("device/{}/report", serial)
}

/// Topic a printer accepts commands on
pub fn request_topic(serial: &str) -> String {
    format!("device/{}/request", serial)
}

/// Extract the serial segment from a `device/<serial>/...` topic.
pub fn serial_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("device"), Some(serial), Some(_)) if !serial.is_empty() => Some(serial),
        _ => None,
    }
}

/// TLS transport that accepts the printers' self-signed certificates.
pub fn insecure_tls_transport() -> Transport {
    Transport::tls_with_config(TlsConfiguration::Simple {
        ca: vec![],
        alpn: None,
        client_auth: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        assert_eq!(report_topic("01S00C123"), "device/01S00C123/report");
        assert_eq!(request_topic("01S00C123"), "device/01S00C123/request");
    }

    #[test]
    fn test_serial_from_topic() {
        assert_eq!(serial_from_topic("device/01S00C123/report"), Some("01S00C123"));
        assert_eq!(serial_from_topic("device/01S00C123/request"), Some("01S00C123"));
        assert_eq!(serial_from_topic("device//report"), None);
        assert_eq!(serial_from_topic("octoPrint/progress"), None);
        assert_eq!(serial_from_topic("device/01S00C123"), None);
    }
}
