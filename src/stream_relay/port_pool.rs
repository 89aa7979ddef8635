//! Relay port pool
//!
//! Ports are proven bindable at allocation time: the pool hands back the
//! bound listener together with the port, so there is no window in which
//! another process can steal the port before the WS server starts.

use std::collections::HashSet;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_BASE_PORT: u16 = 9000;
pub const POOL_SIZE: u16 = 100;

pub struct PortPool {
    base: u16,
    size: u16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            size: POOL_SIZE,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate a port, trying `preferred` first when it falls inside the
    /// pool range. Walks the range in order otherwise.
    pub async fn allocate(&self, preferred: Option<u16>) -> Result<(u16, TcpListener)> {
        let mut allocated = self.allocated.lock().await;

        let in_range =
            |port: u16| port >= self.base && port < self.base + self.size;
        let candidates = preferred
            .filter(|p| in_range(*p))
            .into_iter()
            .chain(self.base..self.base + self.size);

        for port in candidates {
            if allocated.contains(&port) {
                continue;
            }
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    allocated.insert(port);
                    debug!(port = port, "Relay port allocated");
                    return Ok((port, listener));
                }
                // Something else owns the port; skip it.
                Err(_) => continue,
            }
        }

        Err(Error::ResourceExhausted(format!(
            "no free ports in {}..{}",
            self.base,
            self.base + self.size
        )))
    }

    /// Return a port to the pool. The caller must have closed the listener
    /// and stopped the transcoder first.
    pub async fn release(&self, port: u16) {
        let mut allocated = self.allocated.lock().await;
        if allocated.remove(&port) {
            debug!(port = port, "Relay port released");
        }
    }

    pub async fn allocated_count(&self) -> usize {
        self.allocated.lock().await.len()
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT)
    }
}
