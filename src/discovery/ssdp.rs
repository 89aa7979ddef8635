//! SSDP discovery
//!
//! BambuLab printers answer SSDP M-SEARCH on three non-standard ports.
//! Responses are vendor-flavored HTTP headers; the USN carries the serial,
//! usually as `uuid:<serial>::urn:...`, bare on older firmware.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use super::types::{DiscoveryMethod, PrinterCandidate};

const SSDP_MULTICAST: &str = "239.255.255.250";
/// The printers listen on all three, depending on model and firmware.
const SSDP_PORTS: [u16; 3] = [1990, 2021, 1982];
const SEARCH_TARGET: &str = "urn:bambulab-com:device:3dprinter:1";
const SEND_REPEATS: usize = 3;
const SEND_SPACING: Duration = Duration::from_millis(200);
/// How long to collect unicast responses after the last send
const COLLECT_WINDOW: Duration = Duration::from_secs(5);

/// Raw SSDP hit before the LAN-mode flag is resolved
#[derive(Debug, Clone)]
pub struct SsdpResponse {
    pub ip: IpAddr,
    pub name: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub serial: Option<String>,
    /// None when the response carried no DevConnect header
    pub lan_mode: Option<bool>,
}

impl SsdpResponse {
    pub fn into_candidate(self, lan_mode: bool) -> PrinterCandidate {
        PrinterCandidate {
            ip: self.ip,
            name: self.name,
            model: self.model,
            firmware: self.firmware,
            serial: self.serial,
            lan_mode,
            method: DiscoveryMethod::Ssdp,
        }
    }
}

fn m_search(port: u16) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {}\r\n\
         \r\n",
        SSDP_MULTICAST, port, SEARCH_TARGET
    )
}

/// Multicast the search on every vendor port and collect unicast replies,
/// deduplicated by source IP. Socket errors end the collection early; the
/// hits gathered so far are still returned.
pub async fn search() -> Vec<SsdpResponse> {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "SSDP socket bind failed");
            return Vec::new();
        }
    };

    for i in 0..SEND_REPEATS {
        for port in SSDP_PORTS {
            let request = m_search(port);
            let target = format!("{}:{}", SSDP_MULTICAST, port);
            if let Err(e) = socket.send_to(request.as_bytes(), &target).await {
                debug!(target = %target, error = %e, "SSDP send failed");
            }
        }
        if i + 1 < SEND_REPEATS {
            sleep(SEND_SPACING).await;
        }
    }

    let mut hits: HashMap<IpAddr, SsdpResponse> = HashMap::new();
    let deadline = Instant::now() + COLLECT_WINDOW;
    let mut buf = [0u8; 2048];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                    continue;
                };
                if let Some(response) = parse_response(text, addr.ip()) {
                    debug!(ip = %response.ip, model = ?response.model, "SSDP response");
                    hits.entry(addr.ip()).or_insert(response);
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "SSDP receive failed");
                break;
            }
            Err(_) => break,
        }
    }

    let mut responses: Vec<SsdpResponse> = hits.into_values().collect();
    responses.sort_by_key(|r| r.ip);
    responses
}

/// Parse one SSDP answer. Returns `None` unless the search target matches.
pub fn parse_response(text: &str, ip: IpAddr) -> Option<SsdpResponse> {
    if !text.contains(SEARCH_TARGET) {
        return None;
    }

    let mut response = SsdpResponse {
        ip,
        name: None,
        model: None,
        firmware: None,
        serial: None,
        lan_mode: None,
    };

    for line in text.lines() {
        let line = line.trim();
        if let Some(value) = header_value(line, "DevName.bambu.com") {
            response.name = Some(value.to_string());
        } else if let Some(value) = header_value(line, "DevModel.bambu.com") {
            response.model = Some(value.to_string());
        } else if let Some(value) = header_value(line, "DevVersion.bambu.com") {
            response.firmware = Some(value.to_string());
        } else if let Some(value) = header_value(line, "DevConnect.bambu.com") {
            response.lan_mode = Some(value.eq_ignore_ascii_case("lan"));
        } else if let Some(value) = header_value(line, "USN") {
            // uuid:<serial>::urn:... or, on older firmware, the serial alone
            let rest = value.strip_prefix("uuid:").unwrap_or(value);
            let serial = rest
                .split("::")
                .next()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty());
            response.serial = serial.map(str::to_string);
        }
    }

    Some(response)
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    if key.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
        Server: UPnP/1.0\r\n\
        Location: 192.168.1.100\r\n\
        ST: urn:bambulab-com:device:3dprinter:1\r\n\
        USN: uuid:01S00C123400001::urn:bambulab-com:device:3dprinter:1\r\n\
        DevModel.bambu.com: C11\r\n\
        DevName.bambu.com: Shop X1\r\n\
        DevVersion.bambu.com: 01.07.00.00\r\n\
        DevConnect.bambu.com: lan\r\n\r\n";

    #[test]
    fn test_parse_full_response() {
        let ip: IpAddr = "192.168.1.100".parse().unwrap();
        let r = parse_response(RESPONSE, ip).unwrap();
        assert_eq!(r.name.as_deref(), Some("Shop X1"));
        assert_eq!(r.model.as_deref(), Some("C11"));
        assert_eq!(r.firmware.as_deref(), Some("01.07.00.00"));
        assert_eq!(r.serial.as_deref(), Some("01S00C123400001"));
        assert_eq!(r.lan_mode, Some(true));
    }

    #[test]
    fn test_parse_cloud_connect_mode() {
        let text = RESPONSE.replace("DevConnect.bambu.com: lan", "DevConnect.bambu.com: cloud");
        let r = parse_response(&text, "192.168.1.100".parse().unwrap()).unwrap();
        assert_eq!(r.lan_mode, Some(false));
    }

    #[test]
    fn test_parse_bare_usn_serial() {
        let text = "HTTP/1.1 200 OK\r\n\
            ST: urn:bambulab-com:device:3dprinter:1\r\n\
            USN: 00M0A0B0C0D0\r\n\
            DevName.bambu.com: Workshop P1S\r\n\
            DevModel.bambu.com: C12\r\n\
            DevConnect.bambu.com: lan\r\n\r\n";
        let r = parse_response(text, "192.168.2.50".parse().unwrap()).unwrap();
        assert_eq!(r.serial.as_deref(), Some("00M0A0B0C0D0"));
        assert_eq!(r.name.as_deref(), Some("Workshop P1S"));
        assert_eq!(r.lan_mode, Some(true));
    }

    #[test]
    fn test_missing_dev_connect_stays_unresolved() {
        let text = RESPONSE.replace("DevConnect.bambu.com: lan\r\n", "");
        let r = parse_response(&text, "192.168.1.100".parse().unwrap()).unwrap();
        assert_eq!(r.lan_mode, None);
    }

    #[test]
    fn test_foreign_ssdp_response_rejected() {
        let text = "HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:device:MediaRenderer:1\r\n\r\n";
        assert!(parse_response(text, "192.168.1.50".parse().unwrap()).is_none());
    }

    #[test]
    fn test_m_search_format() {
        let req = m_search(2021);
        assert!(req.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(req.contains("HOST: 239.255.255.250:2021\r\n"));
        assert!(req.contains("ST: urn:bambulab-com:device:3dprinter:1\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }
}
