//! TCP probing
//!
//! Two jobs: resolve the LAN-mode flag for SSDP hits that did not carry a
//! DevConnect header, and sweep the local /24 for MJPEG cameras when SSDP
//! finds nothing at all.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;

/// BambuLab LAN liveview port; open only when LAN mode is enabled
const LAN_LIVEVIEW_PORT: u16 = 322;
const LAN_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// mjpg-streamer default port, probed during the fallback sweep
const SWEEP_PORT: u16 = 8080;
const SWEEP_TIMEOUT: Duration = Duration::from_millis(100);
const SWEEP_CONCURRENCY: usize = 32;

/// True when a TCP connect on `port` succeeds within `dur`.
pub async fn port_open(ip: IpAddr, port: u16, dur: Duration) -> bool {
    let addr = SocketAddr::new(ip, port);
    matches!(timeout(dur, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Probe the LAN liveview port to tell LAN-mode printers from cloud-bound
/// ones.
pub async fn lan_mode_open(ip: IpAddr) -> bool {
    port_open(ip, LAN_LIVEVIEW_PORT, LAN_PROBE_TIMEOUT).await
}

/// Probe every host of the /24 around `local_ip` on the camera HTTP port.
/// Returns the responding addresses in ascending order.
pub async fn sweep_subnet(local_ip: Ipv4Addr) -> Vec<IpAddr> {
    let semaphore = Arc::new(Semaphore::new(SWEEP_CONCURRENCY));
    let mut handles = Vec::with_capacity(253);

    for host in subnet_hosts(local_ip) {
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            // Semaphore is never closed, acquire cannot fail.
            let Ok(_permit) = semaphore.acquire().await else {
                return None;
            };
            let ip = IpAddr::V4(host);
            port_open(ip, SWEEP_PORT, SWEEP_TIMEOUT).await.then_some(ip)
        }));
    }

    let mut found = Vec::new();
    for handle in handles {
        if let Ok(Some(ip)) = handle.await {
            debug!(ip = %ip, port = SWEEP_PORT, "Sweep hit");
            found.push(ip);
        }
    }
    found.sort();
    found
}

/// All usable /24 host addresses around `local_ip`, excluding itself.
fn subnet_hosts(local_ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = local_ip.octets();
    (1..=254)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .filter(|ip| *ip != local_ip)
        .collect()
}

/// Local IPv4 of the default route interface, from `ip route get 1`.
pub async fn local_ipv4() -> Option<Ipv4Addr> {
    let output = Command::new("ip")
        .args(["route", "get", "1"])
        .output()
        .await
        .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    // "1.0.0.0 via 192.168.1.1 dev eth0 src 192.168.1.23 uid 0"
    let idx = stdout.find("src ")?;
    stdout[idx + 4..]
        .split_whitespace()
        .next()
        .and_then(|ip| ip.parse().ok())
}
