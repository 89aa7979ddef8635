//! Discovery result types

use std::net::IpAddr;

use serde::Serialize;

/// How a candidate was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Ssdp,
    SubnetSweep,
}

/// A device found on the network, not yet registered
#[derive(Debug, Clone, Serialize)]
pub struct PrinterCandidate {
    pub ip: IpAddr,
    pub name: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub serial: Option<String>,
    /// True when the device has LAN mode enabled and can be driven directly
    pub lan_mode: bool,
    pub method: DiscoveryMethod,
}

impl PrinterCandidate {
    /// Display name, falling back to the model or the bare IP.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| self.ip.to_string())
    }
}
