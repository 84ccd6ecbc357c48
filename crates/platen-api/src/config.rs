//! Server configuration.
//!
//! Loaded from environment variables; this is the canonical runtime
//! configuration path for container deployments.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use platen_core::{Error, Result};
use platen_flow::config::OrchestratorConfig;

/// CORS configuration for browser-based access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Use `["*"]` to allow all origins (development
    /// only). Empty list disables CORS entirely.
    pub allowed_origins: Vec<String>,

    /// Max age for preflight cache (seconds).
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_age_seconds: 3600,
        }
    }
}

/// Configuration for the Platen API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Enable debug mode.
    ///
    /// When enabled the server tolerates an incomplete spawning
    /// configuration and an in-memory storage backend; when disabled both
    /// are validated at startup.
    pub debug: bool,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Local directory for durable snapshots (`PLATEN_DATA_DIR`).
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Downstream URL notified when a batch finalizes.
    #[serde(default)]
    pub notify_url: Option<String>,

    /// Bearer token for the downstream notification.
    #[serde(default)]
    pub notify_token: Option<String>,

    /// Orchestration configuration shared by every batch.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            debug: false,
            cors: CorsConfig::default(),
            data_dir: None,
            notify_url: None,
            notify_token: None,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `PLATEN_HTTP_PORT`
    /// - `PLATEN_DEBUG`
    /// - `PLATEN_CORS_ALLOWED_ORIGINS` (comma-separated, or `*`)
    /// - `PLATEN_CORS_MAX_AGE_SECONDS`
    /// - `PLATEN_DATA_DIR`
    /// - `PLATEN_NOTIFY_URL`
    /// - `PLATEN_NOTIFY_TOKEN`
    /// - `BATCH_SIZE_PHASE`
    /// - `ALARM_DELAY_PHASE` (ms)
    /// - `ALARM_DELAY_ERROR_RETRY` (ms)
    /// - `MAX_ALARM_DELAY_MS`
    /// - `MAX_RETRY_ATTEMPTS`
    /// - `ORCHESTRATOR_URL`
    /// - `FLY_API_BASE`, `FLY_API_TOKEN`, `FLY_APP_NAME`,
    ///   `FLY_WORKER_IMAGE`, `FLY_REGION`
    /// - `PLATEN_WORKER_MEMORY_MB`, `PLATEN_WORKER_CPUS`,
    ///   `PLATEN_WORKER_CPU_KIND`
    /// - `R2_ACCOUNT_ID`, `R2_ACCESS_KEY_ID`, `R2_SECRET_ACCESS_KEY`,
    ///   `R2_BUCKET`
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot
    /// be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("PLATEN_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("PLATEN_DEBUG")? {
            config.debug = debug;
        }
        if let Some(origins) = env_string("PLATEN_CORS_ALLOWED_ORIGINS") {
            config.cors.allowed_origins = parse_cors_allowed_origins(&origins);
        }
        if let Some(max_age) = env_u64("PLATEN_CORS_MAX_AGE_SECONDS")? {
            config.cors.max_age_seconds = max_age;
        }
        config.data_dir = env_string("PLATEN_DATA_DIR");
        config.notify_url = env_string("PLATEN_NOTIFY_URL");
        config.notify_token = env_string("PLATEN_NOTIFY_TOKEN");

        if let Some(batch_size) = env_usize("BATCH_SIZE_PHASE")? {
            config.orchestrator.batch_size = batch_size;
        }
        if let Some(ms) = env_u64("ALARM_DELAY_PHASE")? {
            config.orchestrator.alarm_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("ALARM_DELAY_ERROR_RETRY")? {
            config.orchestrator.alarm_delay_error_retry = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("MAX_ALARM_DELAY_MS")? {
            config.orchestrator.max_alarm_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_u32("MAX_RETRY_ATTEMPTS")? {
            config.orchestrator.max_retry_attempts = attempts;
        }
        if let Some(url) = env_string("ORCHESTRATOR_URL") {
            config.orchestrator.orchestrator_url = url;
        }

        if let Some(base) = env_string("FLY_API_BASE") {
            config.orchestrator.fly.api_base = base;
        }
        if let Some(token) = env_string("FLY_API_TOKEN") {
            config.orchestrator.fly.api_token = token;
        }
        if let Some(app) = env_string("FLY_APP_NAME") {
            config.orchestrator.fly.app_name = app;
        }
        if let Some(image) = env_string("FLY_WORKER_IMAGE") {
            config.orchestrator.fly.worker_image = image;
        }
        if let Some(region) = env_string("FLY_REGION") {
            config.orchestrator.fly.region = region;
        }

        if let Some(memory) = env_u32("PLATEN_WORKER_MEMORY_MB")? {
            config.orchestrator.worker.memory_mb = memory;
        }
        if let Some(cpus) = env_u32("PLATEN_WORKER_CPUS")? {
            config.orchestrator.worker.cpus = cpus;
        }
        if let Some(kind) = env_string("PLATEN_WORKER_CPU_KIND") {
            config.orchestrator.worker.cpu_kind = kind;
        }

        if let Some(account) = env_string("R2_ACCOUNT_ID") {
            config.orchestrator.object_store.account_id = account;
        }
        if let Some(key) = env_string("R2_ACCESS_KEY_ID") {
            config.orchestrator.object_store.access_key_id = key;
        }
        if let Some(secret) = env_string("R2_SECRET_ACCESS_KEY") {
            config.orchestrator.object_store.secret_access_key = secret;
        }
        if let Some(bucket) = env_string("R2_BUCKET") {
            config.orchestrator.object_store.bucket = bucket;
        }

        Ok(config)
    }

    /// Validates that the configuration is complete enough to run.
    ///
    /// In debug mode the spawning configuration may be incomplete.
    ///
    /// # Errors
    ///
    /// Returns an error if a required value is missing outside debug mode.
    pub fn validate(&self) -> Result<()> {
        if self.debug {
            return Ok(());
        }
        self.orchestrator
            .validate()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        if self.data_dir.is_none() {
            return Err(Error::InvalidInput(
                "PLATEN_DATA_DIR is required when PLATEN_DEBUG=false".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_cors_allowed_origins(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed == "*" {
        return vec!["*".to_string()];
    }

    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.http_port, 8080);
        assert!(!config.debug);
        assert!(config.cors.allowed_origins.is_empty());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("TEST", "true").unwrap());
        assert!(parse_bool("TEST", "1").unwrap());
        assert!(!parse_bool("TEST", "FALSE").unwrap());
        assert!(parse_bool("TEST", "maybe").is_err());
    }

    #[test]
    fn cors_origin_parsing() {
        assert_eq!(parse_cors_allowed_origins("*"), vec!["*"]);
        assert_eq!(
            parse_cors_allowed_origins("https://a.test, https://b.test"),
            vec!["https://a.test", "https://b.test"]
        );
        assert!(parse_cors_allowed_origins("  ").is_empty());
    }

    #[test]
    fn validate_is_lenient_in_debug() {
        let config = Config {
            debug: true,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_requires_spawn_config_in_prod() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }
}
