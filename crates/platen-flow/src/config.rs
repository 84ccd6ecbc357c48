//! Orchestrator configuration.
//!
//! One [`OrchestratorConfig`] is shared immutably by every batch. It carries
//! the spawn window, the alarm cadence, the retry budget, the machine-API
//! targeting, the worker resource shape, and the credential bundle handed to
//! workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default maximum number of spawn requests per alarm wake.
const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default delay between normal alarms.
const DEFAULT_ALARM_DELAY: Duration = Duration::from_millis(5000);

/// Default delay between no-progress alarms.
const DEFAULT_ALARM_DELAY_ERROR_RETRY: Duration = Duration::from_millis(30_000);

/// Default ceiling for backed-off no-progress alarms.
const DEFAULT_MAX_ALARM_DELAY: Duration = Duration::from_secs(300);

/// Default consecutive no-progress alarms before the batch fails.
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;

/// Default timeout for a single spawn request.
const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Targeting for the remote machine API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlyConfig {
    /// Machine API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Bearer token for the machine API.
    pub api_token: String,
    /// Application the workers are spawned under.
    pub app_name: String,
    /// Container image reference for the worker.
    pub worker_image: String,
    /// Region workers are placed in.
    pub region: String,
}

fn default_api_base() -> String {
    "https://api.machines.dev".to_string()
}

impl Default for FlyConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_token: String::new(),
            app_name: String::new(),
            worker_image: String::new(),
            region: String::new(),
        }
    }
}

/// Resource shape requested for each worker machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerShape {
    /// Memory in megabytes.
    pub memory_mb: u32,
    /// CPU count.
    pub cpus: u32,
    /// CPU kind (`shared` or `performance`).
    pub cpu_kind: String,
}

impl Default for WorkerShape {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpus: 2,
            cpu_kind: "shared".to_string(),
        }
    }
}

/// Object-store credentials passed to workers in their environment bundle.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Account identifier.
    pub account_id: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Bucket holding staged inputs and transformed outputs.
    pub bucket: String,
}

impl std::fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("account_id", &self.account_id)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("bucket", &self.bucket)
            .finish()
    }
}

/// Configuration shared by every batch orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum spawn requests issued per alarm wake (`BATCH_SIZE_PHASE`).
    pub batch_size: usize,
    /// Delay between normal alarms (`ALARM_DELAY_PHASE`).
    pub alarm_delay: Duration,
    /// Delay between no-progress alarms (`ALARM_DELAY_ERROR_RETRY`).
    pub alarm_delay_error_retry: Duration,
    /// Ceiling for backed-off no-progress alarms.
    pub max_alarm_delay: Duration,
    /// Consecutive no-progress alarms before the batch fails
    /// (`MAX_RETRY_ATTEMPTS`). Also the default per-task retry budget.
    pub max_retry_attempts: u32,
    /// Timeout for a single spawn request.
    pub spawn_timeout: Duration,
    /// Base URL embedded into worker callback URLs (`ORCHESTRATOR_URL`).
    pub orchestrator_url: String,
    /// Machine-API targeting.
    pub fly: FlyConfig,
    /// Worker resource shape.
    pub worker: WorkerShape,
    /// Object-store credential bundle for workers.
    pub object_store: ObjectStoreConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            alarm_delay: DEFAULT_ALARM_DELAY,
            alarm_delay_error_retry: DEFAULT_ALARM_DELAY_ERROR_RETRY,
            max_alarm_delay: DEFAULT_MAX_ALARM_DELAY,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            orchestrator_url: String::new(),
            fly: FlyConfig::default(),
            worker: WorkerShape::default(),
            object_store: ObjectStoreConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Sets the spawn window.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the normal alarm delay.
    #[must_use]
    pub const fn with_alarm_delay(mut self, delay: Duration) -> Self {
        self.alarm_delay = delay;
        self
    }

    /// Sets the no-progress alarm delay.
    #[must_use]
    pub const fn with_alarm_delay_error_retry(mut self, delay: Duration) -> Self {
        self.alarm_delay_error_retry = delay;
        self
    }

    /// Sets the no-progress retry budget.
    #[must_use]
    pub const fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Sets the callback base URL.
    #[must_use]
    pub fn with_orchestrator_url(mut self, url: impl Into<String>) -> Self {
        self.orchestrator_url = url.into();
        self
    }

    /// Validates the configuration for production spawning.
    ///
    /// # Errors
    ///
    /// Returns an error if a field required to spawn real machines is
    /// missing or out of range.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::configuration("batch_size must be greater than zero"));
        }
        if self.max_retry_attempts == 0 {
            return Err(Error::configuration(
                "max_retry_attempts must be greater than zero",
            ));
        }
        if self.spawn_timeout.is_zero() {
            return Err(Error::configuration(
                "spawn_timeout must be greater than zero",
            ));
        }
        if self.orchestrator_url.is_empty() {
            return Err(Error::configuration("orchestrator_url cannot be empty"));
        }
        if self.fly.api_token.is_empty() {
            return Err(Error::configuration("fly api_token cannot be empty"));
        }
        if self.fly.app_name.is_empty() {
            return Err(Error::configuration("fly app_name cannot be empty"));
        }
        if self.fly.worker_image.is_empty() {
            return Err(Error::configuration("fly worker_image cannot be empty"));
        }
        if self.object_store.bucket.is_empty() {
            return Err(Error::configuration("object-store bucket cannot be empty"));
        }
        Ok(())
    }

    /// Returns the callback URL workers post their terminal report to.
    #[must_use]
    pub fn callback_url(&self, batch_id: &str, task_id: &str) -> String {
        let base = self.orchestrator_url.trim_end_matches('/');
        format!("{base}/callback/{batch_id}/{task_id}")
    }
}
