//! Session connection lifecycle
//!
//! Shared by the MQTT-backed sessions. The aggregator never sees these
//! states directly; a session that is not `Active` keeps its printer
//! offline in the snapshot instead.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No connection and not trying
    Disconnected,
    /// Connect or reconnect in flight
    Connecting,
    /// Broker accepted the subscriptions, no data yet
    Subscribed,
    /// Receiving reports
    Active,
    /// Torn down for good; only `remove` produces this
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Subscribed => "subscribed",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}
