//! Downstream finalization notifier.
//!
//! When a batch reaches `DONE` the orchestrator tells the downstream
//! ingest system exactly once. The notification is advisory: a delivery
//! failure is logged, not retried, because the downstream also polls
//! status.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::batch::BatchState;

/// Payload posted to the downstream system when a batch finalizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFinalized {
    /// Batch identity.
    pub batch_id: String,
    /// Terminal status label.
    pub status: String,
    /// Running total of tasks across all phases.
    pub tasks_total: u64,
    /// Tasks completed.
    pub tasks_completed: u64,
    /// Tasks failed.
    pub tasks_failed: u64,
}

impl BatchFinalized {
    /// Builds the payload from a terminal batch state.
    #[must_use]
    pub fn from_state(state: &BatchState) -> Self {
        Self {
            batch_id: state.batch_id.to_string(),
            status: state.status.to_string(),
            tasks_total: state.tasks_total,
            tasks_completed: state.tasks_completed,
            tasks_failed: state.tasks_failed,
        }
    }
}

/// Seam for the downstream "batch finalized" signal.
#[async_trait]
pub trait DownstreamNotifier: Send + Sync {
    /// Delivers the finalization signal. Failures are the implementation's
    /// to log; the orchestrator does not retry.
    async fn notify(&self, payload: &BatchFinalized);
}

/// Notifier that does nothing. Default when no downstream URL is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl DownstreamNotifier for NoopNotifier {
    async fn notify(&self, payload: &BatchFinalized) {
        tracing::debug!(batch_id = %payload.batch_id, "no downstream notifier configured");
    }
}

/// HTTP notifier: POSTs the payload to a configured URL with optional
/// bearer auth.
pub struct HttpNotifier {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNotifier")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpNotifier {
    /// Creates a notifier for the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, token: Option<String>) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| {
                crate::error::Error::configuration(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            url: url.into(),
            token,
            client,
        })
    }
}

#[async_trait]
impl DownstreamNotifier for HttpNotifier {
    async fn notify(&self, payload: &BatchFinalized) {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(batch_id = %payload.batch_id, "downstream notified");
            }
            Ok(response) => {
                tracing::warn!(
                    batch_id = %payload.batch_id,
                    status = %response.status(),
                    "downstream notification rejected"
                );
            }
            Err(err) => {
                tracing::warn!(
                    batch_id = %payload.batch_id,
                    error = %err,
                    "downstream notification failed"
                );
            }
        }
    }
}
