//! Bounded polling until the backend answers

use crate::probe::Prober;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Polling cadence and overall bound for [`wait_until_online`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Time between probes; the first probe happens one interval after entry
    pub poll_interval: Duration,
    /// Measured from entry into the loop, per caller
    pub deadline: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Online { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl WaitOutcome {
    pub fn is_online(&self) -> bool {
        matches!(self, WaitOutcome::Online { .. })
    }
}

/// Probe `address` once per tick until it answers or the deadline passes.
///
/// Nothing cancels the loop early: a client that disconnects mid-wait only
/// stops it if the enclosing future is dropped.
pub async fn wait_until_online(prober: &dyn Prober, address: &str, policy: &WaitPolicy) -> WaitOutcome {
    let started = Instant::now();
    let deadline = tokio::time::sleep(policy.deadline);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval_at(started + policy.poll_interval, policy.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut attempts = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut deadline => {
                info!(
                    address,
                    attempts,
                    waited_secs = started.elapsed().as_secs(),
                    "Timeout reached, server did not wake up"
                );
                return WaitOutcome::TimedOut { attempts };
            }
            _ = ticker.tick() => {
                attempts += 1;
                if prober.is_up(address).await {
                    info!(address, attempts, waited_ms = started.elapsed().as_millis() as u64, "Server is up");
                    return WaitOutcome::Online { attempts };
                }
                debug!(address, attempts, "Server still offline");
            }
        }
    }
}
