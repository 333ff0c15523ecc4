//! Backend availability probing over TCP

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default bound on a single connect attempt
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Answers "is the backend reachable right now?"
#[async_trait]
pub trait Prober: Send + Sync {
    async fn is_up(&self, address: &str) -> bool;
}

/// Probes by opening a TCP connection and dropping it immediately
#[derive(Debug, Clone)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TcpProber {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn is_up(&self, address: &str) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => {
                debug!(address, "Probe succeeded (TCP connect)");
                true
            }
            Ok(Err(e)) => {
                debug!(address, error = %e, "Probe failed (connection error)");
                false
            }
            Err(_) => {
                debug!(address, timeout_ms = self.timeout.as_millis() as u64, "Probe failed (timeout)");
                false
            }
        }
    }
}
