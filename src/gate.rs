//! Per-request gating: decide whether a request may be forwarded now,
//! after a wake, or not at all.
//!
//! ```text
//! Classify --no match--> Forward
//!    |
//!  match
//!    v
//! CheckUp --up--> Forward
//!    |
//!  down
//!    v
//!  Wake --(sent | failed | already in progress)--> Wait
//!                                                   |
//!                          online --> Forward ------+------ timed out --> TimeoutResponse
//! ```

use crate::error::{json_error_response, text_response, ForwardError, ProxyBody};
use crate::matcher::WakeTriggerSet;
use crate::probe::Prober;
use crate::wait::{wait_until_online, WaitOutcome, WaitPolicy};
use crate::wake::{WakeCoordinator, WakeOutcome};
use async_trait::async_trait;
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{error, info};

/// Body of the response sent when the backend did not come up in time
pub const OFFLINE_MESSAGE: &str = "Server is still offline. Please try again later.";

/// Sends a request to the proxy target and streams the response back
#[async_trait]
pub trait Forwarder<B>: Send + Sync {
    async fn forward(&self, req: Request<B>) -> Result<Response<ProxyBody>, ForwardError>;
}

/// Terminal decision for a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Not a trigger path, or the backend was already up
    Forward,
    /// The backend had to be woken and is now answering
    ForwardAfterWake,
    /// The backend did not answer before the deadline
    TimedOut,
}

pub struct RequestGate {
    triggers: WakeTriggerSet,
    probe_address: String,
    prober: Arc<dyn Prober>,
    coordinator: Arc<WakeCoordinator>,
    wait_policy: WaitPolicy,
}

impl RequestGate {
    pub fn new(
        triggers: WakeTriggerSet,
        probe_address: impl Into<String>,
        prober: Arc<dyn Prober>,
        coordinator: Arc<WakeCoordinator>,
        wait_policy: WaitPolicy,
    ) -> Self {
        Self {
            triggers,
            probe_address: probe_address.into(),
            prober,
            coordinator,
            wait_policy,
        }
    }

    pub fn coordinator(&self) -> &Arc<WakeCoordinator> {
        &self.coordinator
    }

    /// Run Classify, CheckUp, Wake and Wait for `path`
    pub async fn admit(&self, path: &str) -> Admission {
        if !self.triggers.matches(path) {
            return Admission::Forward;
        }

        if self.prober.is_up(&self.probe_address).await {
            return Admission::Forward;
        }

        info!(path, "Server is offline, trying to wake up using Wake On Lan");
        let outcome = self.coordinator.attempt_wake().await;
        if outcome == WakeOutcome::AlreadyInProgress {
            info!(path, "Waiting on wake up started by another request");
        }

        match wait_until_online(self.prober.as_ref(), &self.probe_address, &self.wait_policy).await {
            WaitOutcome::Online { .. } => Admission::ForwardAfterWake,
            WaitOutcome::TimedOut { .. } => Admission::TimedOut,
        }
    }

    /// Gate `req`, then forward it or answer with [`OFFLINE_MESSAGE`]
    pub async fn handle<B>(&self, req: Request<B>, forwarder: &dyn Forwarder<B>) -> Response<ProxyBody>
    where
        B: Send + 'static,
    {
        let path = req.uri().path().to_string();

        match self.admit(&path).await {
            Admission::Forward => forward_or_error(req, forwarder, &path).await,
            Admission::ForwardAfterWake => {
                let response = forward_or_error(req, forwarder, &path).await;
                let coordinator = Arc::clone(&self.coordinator);
                tokio::spawn(async move {
                    let notified = coordinator.notify_online().await;
                    info!(sessions = notified, "Notified sessions that the server is up");
                });
                response
            }
            Admission::TimedOut => text_response(StatusCode::OK, OFFLINE_MESSAGE),
        }
    }
}

async fn forward_or_error<B>(req: Request<B>, forwarder: &dyn Forwarder<B>, path: &str) -> Response<ProxyBody>
where
    B: Send + 'static,
{
    match forwarder.forward(req).await {
        Ok(response) => response,
        Err(e) => {
            // Detailed error stays in the log
            error!(path, error = %e, "Failed to forward request");
            let message = match &e {
                ForwardError::Timeout(secs) => format!("Request timed out after {} seconds", secs),
                _ => "Failed to connect to backend".to_string(),
            };
            json_error_response(e.code(), message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::empty_response;
    use crate::wake::fakes::{CallLog, FakeNotifier, FakeSignaler};
    use crate::wake::{WakeMessages, WakeTarget};
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Down until `set_up` is called
    #[derive(Default)]
    struct SwitchProber {
        up: AtomicBool,
        probes: AtomicUsize,
    }

    impl SwitchProber {
        fn set_up(&self) {
            self.up.store(true, Ordering::SeqCst);
        }

        fn probes(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Prober for SwitchProber {
        async fn is_up(&self, _address: &str) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.up.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingForwarder {
        forwarded: parking_lot::Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Forwarder<()> for RecordingForwarder {
        async fn forward(&self, req: Request<()>) -> Result<Response<ProxyBody>, ForwardError> {
            self.forwarded.lock().push(req.uri().path().to_string());
            if self.fail {
                return Err(ForwardError::RequestBuild("refused".into()));
            }
            Ok(empty_response(StatusCode::NO_CONTENT))
        }
    }

    struct Harness {
        gate: RequestGate,
        prober: Arc<SwitchProber>,
        signaler: Arc<FakeSignaler>,
        log: CallLog,
    }

    fn harness(policy: WaitPolicy) -> Harness {
        harness_with_signal_delay(policy, Duration::ZERO)
    }

    fn harness_with_signal_delay(policy: WaitPolicy, delay: Duration) -> Harness {
        let log = CallLog::default();
        let mut signaler = FakeSignaler::new(Arc::clone(&log));
        signaler.delay = delay;
        let signaler = Arc::new(signaler);
        let prober = Arc::new(SwitchProber::default());
        let coordinator = Arc::new(WakeCoordinator::new(
            WakeTarget {
                mac_address: "aa:bb:cc:dd:ee:ff".into(),
                broadcast_address: "255.255.255.255:9".into(),
            },
            Arc::new(FakeNotifier { log: Arc::clone(&log) }),
            Arc::clone(&signaler) as Arc<dyn crate::wol::WakeSignaler>,
            WakeMessages::default(),
        ));
        let gate = RequestGate::new(
            WakeTriggerSet::new(["/stream/*", "/System/Info"]),
            "10.0.0.2:8096",
            Arc::clone(&prober) as Arc<dyn Prober>,
            coordinator,
            policy,
        );
        Harness {
            gate,
            prober,
            signaler,
            log,
        }
    }

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_trigger_path_skips_probe() {
        let h = harness(WaitPolicy::default());
        let forwarder = RecordingForwarder::default();

        let response = h.gate.handle(request("/api/other"), &forwarder).await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(h.prober.probes(), 0);
        assert_eq!(h.signaler.sent(), 0);
        assert_eq!(*forwarder.forwarded.lock(), vec!["/api/other"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_path_backend_up_forwards() {
        let h = harness(WaitPolicy::default());
        h.prober.set_up();
        let forwarder = RecordingForwarder::default();

        let response = h.gate.handle(request("/stream/movie.mp4"), &forwarder).await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(h.prober.probes(), 1);
        assert_eq!(h.signaler.sent(), 0);
        assert!(h.log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_writes_offline_message() {
        let h = harness(WaitPolicy {
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(20),
        });
        let forwarder = RecordingForwarder::default();

        let response = h.gate.handle(request("/stream/movie.mp4"), &forwarder).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, OFFLINE_MESSAGE);
        assert_eq!(h.signaler.sent(), 1);
        assert!(forwarder.forwarded.lock().is_empty());
        assert!(!h.gate.coordinator().state().is_waking_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_then_forward_and_notify_online() {
        let h = harness(WaitPolicy::default());
        let forwarder = RecordingForwarder::default();
        let prober = Arc::clone(&h.prober);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            prober.set_up();
        });

        let response = h.gate.handle(request("/System/Info"), &forwarder).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(h.signaler.sent(), 1);
        assert_eq!(*forwarder.forwarded.lock(), vec!["/System/Info"]);

        // Post-wake notification is spawned
        tokio::time::sleep(Duration::from_millis(10)).await;
        let log = h.log.lock();
        assert!(log[0].starts_with("notify active:"));
        assert!(log.iter().any(|entry| entry.starts_with("notify all:")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_outcomes() {
        let h = harness(WaitPolicy {
            poll_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(3),
        });

        assert_eq!(h.gate.admit("/nope").await, Admission::Forward);
        assert_eq!(h.gate.admit("/stream/a").await, Admission::TimedOut);

        h.prober.set_up();
        assert_eq!(h.gate.admit("/stream/a").await, Admission::Forward);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_failure_becomes_error_response() {
        let h = harness(WaitPolicy::default());
        let forwarder = RecordingForwarder {
            fail: true,
            ..Default::default()
        };

        let response = h.gate.handle(request("/api/other"), &forwarder).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "INTERNAL_ERROR");
        assert_eq!(forwarder.forwarded.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_wake() {
        // Signal takes a second, so the second request lands inside the window
        let h = Arc::new(harness_with_signal_delay(WaitPolicy::default(), Duration::from_secs(1)));
        let forwarder = Arc::new(RecordingForwarder::default());

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let h = Arc::clone(&h);
                let forwarder = Arc::clone(&forwarder);
                tokio::spawn(async move {
                    let path = format!("/stream/{}.mp4", i);
                    h.gate.handle(request(&path), forwarder.as_ref()).await.status()
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_secs(7)).await;
        h.prober.set_up();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), StatusCode::NO_CONTENT);
        }
        assert_eq!(h.signaler.sent(), 1);
        assert_eq!(forwarder.forwarded.lock().len(), 2);
    }
}
