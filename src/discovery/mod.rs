//! Printer discovery
//!
//! ## Responsibilities
//!
//! - SSDP M-SEARCH for BambuLab printers on the vendor's three ports
//! - Resolve the LAN-mode flag via a liveview-port probe when the SSDP
//!   response leaves it open
//! - Fall back to a /24 TCP sweep for MJPEG cameras when SSDP is silent
//!
//! Discovery never mutates the inventory; it only reports candidates.
//! Socket errors are logged and swallowed, an empty scan is a valid scan.

pub mod probe;
pub mod ssdp;
mod types;

pub use types::{DiscoveryMethod, PrinterCandidate};

use tracing::info;

/// One full discovery pass.
pub async fn scan() -> Vec<PrinterCandidate> {
    let responses = ssdp::search().await;

    if !responses.is_empty() {
        let mut candidates = Vec::with_capacity(responses.len());
        for response in responses {
            let lan_mode = match response.lan_mode {
                Some(flag) => flag,
                None => probe::lan_mode_open(response.ip).await,
            };
            candidates.push(response.into_candidate(lan_mode));
        }
        info!(count = candidates.len(), "Discovery finished via SSDP");
        return candidates;
    }

    // Nothing answered SSDP; sweep the local /24 for plain cameras.
    let Some(local_ip) = probe::local_ipv4().await else {
        info!("Discovery found nothing; local address unknown, skipping sweep");
        return Vec::new();
    };

    let candidates: Vec<PrinterCandidate> = probe::sweep_subnet(local_ip)
        .await
        .into_iter()
        .map(|ip| PrinterCandidate {
            ip,
            name: None,
            model: None,
            firmware: None,
            serial: None,
            lan_mode: false,
            method: DiscoveryMethod::SubnetSweep,
        })
        .collect();
    info!(count = candidates.len(), "Discovery finished via subnet sweep");
    candidates
}
