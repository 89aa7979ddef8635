//! Reconnect backoff shared by the MQTT sessions
//!
//! ## Responsibilities
//!
//! - Exponential delay schedule (1s, 2s, 4s, 8s, ... capped at 30s)
//! - Cancellation-aware sleeping between attempts
//! - Reset on successful connection

use std::time::Duration;
use tokio::sync::watch;

/// Initial delay after the first failure
const INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Delay cap
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential reconnect backoff
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
}

impl Backoff {
    /// Create a fresh backoff at the initial delay
    pub fn new() -> Self {
        Self {
            next: INITIAL_DELAY,
        }
    }

    /// Delay to wait before the next attempt; doubles for the one after,
    /// capped at 30s
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_DELAY);
        delay
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.next = INITIAL_DELAY;
    }

    /// Sleep for the next backoff delay, returning early with `false`
    /// when the shutdown channel fires
    pub async fn sleep(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
