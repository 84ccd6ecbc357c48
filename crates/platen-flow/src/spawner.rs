//! Remote machine spawning.
//!
//! The orchestrator asks for one ephemeral machine per task through the
//! [`MachineSpawner`] seam. [`FlyMachineSpawner`] is the production
//! implementation: a thin `POST {api_base}/v1/apps/{app}/machines` with
//! bearer auth and no internal retry. Retrying is the orchestrator's
//! concern, which is why errors come back classified as transient or
//! permanent rather than already handled.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{OrchestratorConfig, WorkerShape};
use crate::error::{Error, Result};

/// Maximum length of a machine name accepted by the machine API.
const MACHINE_NAME_MAX: usize = 63;

/// A spawn request for one worker machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Machine name, derived from the task id for idempotent debugging.
    pub name: String,
    /// Placement region.
    pub region: String,
    /// Worker image reference.
    pub image: String,
    /// Environment bundle handed to the worker.
    pub env: BTreeMap<String, String>,
    /// Resource shape.
    pub guest: WorkerShape,
}

/// Spawn failure, classified for retry policy.
///
/// The orchestrator currently treats both classes the same (the task stays
/// pending), but the classification is part of the contract so policy can
/// evolve without touching the spawner.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpawnError {
    /// Network failure, timeout, 5xx, or rate limit. Worth retrying.
    #[error("transient spawn error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },
    /// Malformed request or a non-rate-limit 4xx. Retrying won't help.
    #[error("permanent spawn error: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },
}

impl SpawnError {
    /// Returns true for the transient class.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Contract over the external machine API.
///
/// Stateless: one call, one machine. Implementations must not retry
/// internally.
#[async_trait]
pub trait MachineSpawner: Send + Sync {
    /// Requests a new ephemeral machine.
    ///
    /// Returns the opaque machine handle on success.
    ///
    /// # Errors
    ///
    /// Returns a classified [`SpawnError`] on failure.
    async fn spawn(&self, spec: &MachineSpec) -> std::result::Result<String, SpawnError>;
}

/// Sanitizes a task id into a machine name.
///
/// Machine names must be lowercase alphanumeric with hyphens and at most
/// 63 characters.
#[must_use]
pub fn machine_name(task_id: &str) -> String {
    let sanitized: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    let name = if sanitized.starts_with(|c: char| c.is_ascii_lowercase()) {
        sanitized
    } else {
        format!("w-{sanitized}")
    };

    name.chars().take(MACHINE_NAME_MAX).collect()
}

// ============================================================================
// Fly Machines implementation
// ============================================================================

/// Machine API request body for creating a machine.
#[derive(Debug, Serialize)]
struct CreateMachineRequest<'a> {
    name: &'a str,
    region: &'a str,
    config: MachineConfig<'a>,
}

/// Machine configuration within a create request.
#[derive(Debug, Serialize)]
struct MachineConfig<'a> {
    image: &'a str,
    env: &'a BTreeMap<String, String>,
    auto_destroy: bool,
    restart: RestartPolicy,
    guest: GuestSpec<'a>,
}

/// Restart policy: workers run exactly one attempt and exit.
#[derive(Debug, Serialize)]
struct RestartPolicy {
    policy: &'static str,
}

/// Resource shape within a create request.
#[derive(Debug, Serialize)]
struct GuestSpec<'a> {
    memory_mb: u32,
    cpus: u32,
    cpu_kind: &'a str,
}

/// Machine API success response.
#[derive(Debug, Deserialize)]
struct CreateMachineResponse {
    id: String,
}

/// Production spawner backed by the Fly Machines API.
pub struct FlyMachineSpawner {
    api_base: String,
    api_token: String,
    app_name: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for FlyMachineSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlyMachineSpawner")
            .field("api_base", &self.api_base)
            .field("api_token", &"[REDACTED]")
            .field("app_name", &self.app_name)
            .finish_non_exhaustive()
    }
}

impl FlyMachineSpawner {
    /// Creates a spawner from the orchestrator configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the machine-API targeting is incomplete or the
    /// HTTP client cannot be built.
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        if config.fly.api_token.is_empty() {
            return Err(Error::configuration("fly api_token cannot be empty"));
        }
        if config.fly.app_name.is_empty() {
            return Err(Error::configuration("fly app_name cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.spawn_timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            api_base: config.fly.api_base.trim_end_matches('/').to_string(),
            api_token: config.fly.api_token.clone(),
            app_name: config.fly.app_name.clone(),
            client,
        })
    }

    fn machines_url(&self) -> String {
        format!("{}/v1/apps/{}/machines", self.api_base, self.app_name)
    }
}

#[async_trait]
impl MachineSpawner for FlyMachineSpawner {
    async fn spawn(&self, spec: &MachineSpec) -> std::result::Result<String, SpawnError> {
        let request = CreateMachineRequest {
            name: &spec.name,
            region: &spec.region,
            config: MachineConfig {
                image: &spec.image,
                env: &spec.env,
                auto_destroy: true,
                restart: RestartPolicy { policy: "no" },
                guest: GuestSpec {
                    memory_mb: spec.guest.memory_mb,
                    cpus: spec.guest.cpus,
                    cpu_kind: &spec.guest.cpu_kind,
                },
            },
        };

        let response = self
            .client
            .post(self.machines_url())
            .bearer_auth(&self.api_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| SpawnError::Transient {
                message: format!("machine API request failed: {e}"),
            })?;

        let status = response.status();

        if status.is_success() {
            let created: CreateMachineResponse =
                response.json().await.map_err(|e| SpawnError::Transient {
                    message: format!("failed to parse machine API response: {e}"),
                })?;
            return Ok(created.id);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        let message = format!("machine API returned {status}: {body}");

        if status.is_server_error() || status.as_u16() == 429 {
            Err(SpawnError::Transient { message })
        } else {
            Err(SpawnError::Permanent { message })
        }
    }
}

// ============================================================================
// Test double
// ============================================================================

/// Scripted spawner for tests.
///
/// Records every spawn request and replays programmed outcomes; once the
/// script is exhausted every spawn succeeds with a generated handle.
#[derive(Debug, Default)]
pub struct MockSpawner {
    outcomes: Mutex<VecDeque<std::result::Result<String, SpawnError>>>,
    requests: Mutex<Vec<MachineSpec>>,
    counter: AtomicU64,
}

impl MockSpawner {
    /// Creates a mock spawner that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs the next spawn outcome.
    pub fn push_outcome(&self, outcome: std::result::Result<String, SpawnError>) {
        self.outcomes
            .lock()
            .expect("mock lock poisoned")
            .push_back(outcome);
    }

    /// Programs the next `n` spawns to fail transiently.
    pub fn fail_next(&self, n: usize) {
        for _ in 0..n {
            self.push_outcome(Err(SpawnError::Transient {
                message: "machine API returned 500".to_string(),
            }));
        }
    }

    /// Returns all recorded spawn requests.
    #[must_use]
    pub fn requests(&self) -> Vec<MachineSpec> {
        self.requests.lock().expect("mock lock poisoned").clone()
    }

    /// Returns the number of spawn calls made.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.requests.lock().expect("mock lock poisoned").len()
    }
}

#[async_trait]
impl MachineSpawner for MockSpawner {
    async fn spawn(&self, spec: &MachineSpec) -> std::result::Result<String, SpawnError> {
        self.requests
            .lock()
            .expect("mock lock poisoned")
            .push(spec.clone());

        if let Some(outcome) = self.outcomes.lock().expect("mock lock poisoned").pop_front() {
            return outcome;
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(format!("machine-{n}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_name_sanitizes_task_ids() {
        assert_eq!(
            machine_name("B1:TIFF_CONVERSION:abcd1234"),
            "b1-tiff-conversion-abcd1234"
        );
    }

    #[test]
    fn machine_name_prefixes_non_letter_start() {
        assert_eq!(machine_name("9abc"), "w-9abc");
        assert_eq!(machine_name(":abc"), "w--abc");
    }

    #[test]
    fn machine_name_truncates() {
        let long = "a".repeat(100);
        assert_eq!(machine_name(&long).len(), MACHINE_NAME_MAX);
    }

    #[test]
    fn spawner_rejects_missing_token() {
        let config = OrchestratorConfig {
            fly: crate::config::FlyConfig {
                app_name: "app".to_string(),
                ..crate::config::FlyConfig::default()
            },
            ..OrchestratorConfig::default()
        };
        assert!(FlyMachineSpawner::new(&config).is_err());
    }

    #[test]
    fn spawner_builds_machines_url() -> Result<()> {
        let config = OrchestratorConfig {
            fly: crate::config::FlyConfig {
                api_base: "https://api.machines.dev/".to_string(),
                api_token: "tok".to_string(),
                app_name: "platen-workers".to_string(),
                worker_image: "img".to_string(),
                region: "iad".to_string(),
            },
            ..OrchestratorConfig::default()
        };
        let spawner = FlyMachineSpawner::new(&config)?;
        assert_eq!(
            spawner.machines_url(),
            "https://api.machines.dev/v1/apps/platen-workers/machines"
        );
        Ok(())
    }

    #[tokio::test]
    async fn mock_spawner_replays_script_then_succeeds() {
        let spawner = MockSpawner::new();
        spawner.fail_next(1);

        let spec = MachineSpec {
            name: "w-test".to_string(),
            region: "iad".to_string(),
            image: "img".to_string(),
            env: BTreeMap::new(),
            guest: WorkerShape::default(),
        };

        let first = spawner.spawn(&spec).await;
        assert!(matches!(first, Err(SpawnError::Transient { .. })));

        let second = spawner.spawn(&spec).await;
        assert!(second.is_ok());
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[test]
    fn transient_classification() {
        let err = SpawnError::Transient {
            message: "timeout".to_string(),
        };
        assert!(err.is_transient());

        let err = SpawnError::Permanent {
            message: "422".to_string(),
        };
        assert!(!err.is_transient());
    }
}
