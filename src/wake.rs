//! Single-flight wake coordination
//!
//! [`WakeState`] is the only mutable state shared between requests. The
//! mutex is held just long enough to flip the flag; the flag itself stays
//! set for the whole wake attempt, and a [`WakeGuard`] clears it on every
//! exit path.

use crate::notify::Notifier;
use crate::wol::WakeSignaler;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// "A wake sequence is in progress" flag
#[derive(Debug, Default)]
pub struct WakeState {
    waking_up: Mutex<bool>,
}

impl WakeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_waking_up(&self) -> bool {
        *self.waking_up.lock()
    }

    /// Transition idle -> in progress. Returns false if already in progress.
    pub fn start_waking_up(&self) -> bool {
        let mut waking_up = self.waking_up.lock();
        if *waking_up {
            return false;
        }
        *waking_up = true;
        true
    }

    pub fn done_waking_up(&self) {
        *self.waking_up.lock() = false;
    }

    /// Claim the wake window, releasing it when the guard drops
    pub fn try_begin(&self) -> Option<WakeGuard<'_>> {
        self.start_waking_up().then_some(WakeGuard { state: self })
    }
}

/// Holds the wake window open; resets [`WakeState`] on drop
#[must_use = "dropping the guard immediately ends the wake window"]
pub struct WakeGuard<'a> {
    state: &'a WakeState,
}

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        self.state.done_waking_up();
    }
}

/// Hardware identity of the sleeping backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeTarget {
    pub mac_address: String,
    pub broadcast_address: String,
}

/// Texts shown to connected clients around a wake
#[derive(Debug, Clone)]
pub struct WakeMessages {
    pub header: String,
    pub starting: String,
    pub online: String,
}

impl Default for WakeMessages {
    fn default() -> Self {
        Self {
            header: "Information".to_string(),
            starting: "The server is starting...\nPlease wait".to_string(),
            online: "The server is up".to_string(),
        }
    }
}

/// Result of a single [`WakeCoordinator::attempt_wake`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// This call owned the wake window and the signal went out
    Sent,
    /// This call owned the wake window but the signal could not be sent
    SignalFailed,
    /// Another request is already waking the backend
    AlreadyInProgress,
}

impl WakeOutcome {
    /// Whether this call was the one that owned the wake window
    pub fn initiated(&self) -> bool {
        !matches!(self, WakeOutcome::AlreadyInProgress)
    }
}

pub struct WakeCoordinator {
    state: WakeState,
    target: WakeTarget,
    notifier: Arc<dyn Notifier>,
    signaler: Arc<dyn WakeSignaler>,
    messages: WakeMessages,
}

impl WakeCoordinator {
    pub fn new(
        target: WakeTarget,
        notifier: Arc<dyn Notifier>,
        signaler: Arc<dyn WakeSignaler>,
        messages: WakeMessages,
    ) -> Self {
        Self {
            state: WakeState::new(),
            target,
            notifier,
            signaler,
            messages,
        }
    }

    pub fn state(&self) -> &WakeState {
        &self.state
    }

    /// Notify playing sessions, then send one wake signal.
    ///
    /// Collapses to [`WakeOutcome::AlreadyInProgress`] when another request
    /// holds the wake window. Never waits for the backend to come up.
    pub async fn attempt_wake(&self) -> WakeOutcome {
        let Some(_guard) = self.state.try_begin() else {
            info!("There is already a wake up in progress");
            return WakeOutcome::AlreadyInProgress;
        };

        let notified = self
            .notifier
            .notify_sessions_with_active_queue(&self.messages.header, &self.messages.starting)
            .await;
        info!(sessions = notified, "Notified playing sessions of wake up");

        match self
            .signaler
            .send_wake_signal(&self.target.mac_address, &self.target.broadcast_address)
            .await
        {
            Ok(()) => {
                info!(
                    mac = %self.target.mac_address,
                    broadcast = %self.target.broadcast_address,
                    "Magic packet sent"
                );
                WakeOutcome::Sent
            }
            Err(e) => {
                warn!(
                    mac = %self.target.mac_address,
                    broadcast = %self.target.broadcast_address,
                    error = %e,
                    "Failed to send magic packet"
                );
                WakeOutcome::SignalFailed
            }
        }
    }

    /// Tell every session the backend answered
    pub async fn notify_online(&self) -> usize {
        self.notifier
            .notify_all_sessions(&self.messages.header, &self.messages.online)
            .await
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use crate::error::WakeError;
    use crate::notify::Notifier;
    use crate::wol::WakeSignaler;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Shared, ordered record of collaborator calls
    pub type CallLog = Arc<Mutex<Vec<String>>>;

    pub struct FakeSignaler {
        pub sent: AtomicUsize,
        pub delay: Duration,
        pub fail: bool,
        pub log: CallLog,
    }

    impl FakeSignaler {
        pub fn new(log: CallLog) -> Self {
            Self {
                sent: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
                log,
            }
        }

        pub fn sent(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WakeSignaler for FakeSignaler {
        async fn send_wake_signal(&self, mac_address: &str, _broadcast: &str) -> Result<(), WakeError> {
            self.log.lock().push(format!("wake {}", mac_address));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(WakeError::Send(std::io::Error::other("network unreachable")));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct FakeNotifier {
        pub log: CallLog,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify_all_sessions(&self, _header: &str, text: &str) -> usize {
            self.log.lock().push(format!("notify all: {}", text));
            1
        }

        async fn notify_sessions_with_active_queue(&self, _header: &str, text: &str) -> usize {
            self.log.lock().push(format!("notify active: {}", text));
            1
        }
    }
}
