//! Vendor cloud account and device types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account region as reported at login. Persisted with the credentials but
/// not used for endpoint routing; the broker host is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudRegion {
    #[default]
    Us,
    Eu,
    Cn,
}

/// Contents of the persisted credentials document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudCredentials {
    pub email: String,
    pub token: String,
    pub user_id: String,
    pub connected: bool,
    #[serde(default)]
    pub region: CloudRegion,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Result of a login attempt. A verification demand is a normal outcome,
/// not an error; the caller retries with the emailed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    LoggedIn { token: String },
    NeedsVerification,
}

impl LoginOutcome {
    pub fn needs_verification(&self) -> bool {
        matches!(self, Self::NeedsVerification)
    }
}

/// One device from the account's bind list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudDevice {
    pub dev_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dev_access_code: String,
    #[serde(default)]
    pub dev_model_name: Option<String>,
    #[serde(default)]
    pub dev_product_name: Option<String>,
    #[serde(default)]
    pub online: bool,
}

/// Outcome of a live-stream lookup for a cloud device. The camera feed is
/// frequently unavailable (device offline, LAN-only mode); that is a value,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveStream {
    Available { url: String, token: Option<String> },
    Unavailable { reason: String },
}
