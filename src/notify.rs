//! On-screen messages to clients connected to the media server
//!
//! Uses the backend's session API: list sessions, then post a message to
//! each selected session. Every failure is logged and swallowed.

use crate::error::NotifyError;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header carrying the API key on every session API call
pub const TOKEN_HEADER: &str = "X-MediaBrowser-Token";

/// Best-effort notifications to connected sessions.
///
/// Both methods return how many sessions were messaged successfully.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_all_sessions(&self, header: &str, text: &str) -> usize;
    async fn notify_sessions_with_active_queue(&self, header: &str, text: &str) -> usize;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionMessage<'a> {
    header: &'a str,
    text: &'a str,
    timeout_ms: u64,
}

/// Ids of the sessions that should receive a message
pub fn select_sessions(sessions: &[Value], active_queue_only: bool) -> Vec<String> {
    sessions
        .iter()
        .filter(|session| {
            !active_queue_only
                || session
                    .get("NowPlayingQueue")
                    .and_then(Value::as_array)
                    .map(|queue| !queue.is_empty())
                    .unwrap_or(false)
        })
        .filter_map(|session| session.get("Id").and_then(Value::as_str).map(String::from))
        .collect()
}

/// Notifier backed by the media server's HTTP session API
pub struct SessionNotifier {
    base_url: String,
    api_key: String,
    message_timeout_ms: u64,
    http_client: reqwest::Client,
}

impl SessionNotifier {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        message_timeout_ms: u64,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            message_timeout_ms,
            http_client,
        })
    }

    async fn fetch_sessions(&self) -> Result<Vec<Value>, NotifyError> {
        let url = format!("{}/Sessions", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .header(TOKEN_HEADER, &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }

        Ok(response.json::<Vec<Value>>().await?)
    }

    async fn send_message(&self, session_id: &str, header: &str, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/Sessions/{}/Message", self.base_url, session_id);
        let message = SessionMessage {
            header,
            text,
            timeout_ms: self.message_timeout_ms,
        };

        let response = self
            .http_client
            .post(&url)
            .header(TOKEN_HEADER, &self.api_key)
            .json(&message)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }

    async fn notify(&self, header: &str, text: &str, active_queue_only: bool) -> usize {
        debug!(base_url = %self.base_url, "Fetching sessions");
        let sessions = match self.fetch_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Failed to fetch sessions");
                return 0;
            }
        };

        let ids = select_sessions(&sessions, active_queue_only);
        let results = join_all(ids.iter().map(|id| self.send_message(id, header, text))).await;

        let mut sent = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(session_id = %id, "Message sent to session");
                    sent += 1;
                }
                Err(e) => warn!(session_id = %id, error = %e, "Failed to send message to session"),
            }
        }
        sent
    }
}

#[async_trait]
impl Notifier for SessionNotifier {
    async fn notify_all_sessions(&self, header: &str, text: &str) -> usize {
        self.notify(header, text, false).await
    }

    async fn notify_sessions_with_active_queue(&self, header: &str, text: &str) -> usize {
        self.notify(header, text, true).await
    }
}
