//! HTTP server for the Platen orchestrator.
//!
//! Provides health, status, callback, admin, and queue-delivery endpoints.
//! The router owns one [`Orchestrator`] shared across requests; every
//! endpoint is a thin adapter between the wire contract and the
//! orchestrator's operations.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use platen_core::BatchId;
use platen_core::storage::{MemoryBackend, StorageBackend};
use platen_flow::error::{Error as FlowError, Result as FlowResult};
use platen_flow::message::BatchMessage;
use platen_flow::notify::{DownstreamNotifier, HttpNotifier, NoopNotifier};
use platen_flow::orchestrator::Orchestrator;
use platen_flow::spawner::{FlyMachineSpawner, MachineSpawner, MockSpawner};
use platen_flow::store::DocumentStore;
use platen_flow::task::CallbackPayload;

use crate::config::{Config, CorsConfig};
use crate::error::{ApiError, ApiResult};

/// Shared state behind every request handler.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The batch orchestrator.
    pub orchestrator: Orchestrator,
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("storage", &"<StorageBackend>")
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Body of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok` when the process is alive.
    pub status: String,
    /// Service identifier.
    pub service: String,
    /// Server time.
    pub timestamp: DateTime<Utc>,
}

/// Body of `GET /ready`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    /// True when dependencies are reachable.
    pub ready: bool,
    /// Failure detail when not ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Generic acknowledgement body.
#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    /// Always true.
    pub ok: bool,
    /// Optional human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// Shallow: returns 200 whenever the process is alive.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "platen-orchestrator".to_string(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint handler.
///
/// A `head` on a missing key is sufficient to validate that the storage
/// backend is reachable.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.head("__platen/ready-check").await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("storage check failed: {e}")),
            }),
        ),
    }
}

fn parse_batch_id(raw: &str) -> ApiResult<BatchId> {
    raw.parse()
        .map_err(|e| ApiError::bad_request(format!("invalid batch id: {e}")))
}

/// `GET /status/{batch_id}`: the poller-facing source of truth.
async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let batch_id = parse_batch_id(&batch_id)?;
    let view = state
        .orchestrator
        .get_status(&batch_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("batch not found: {batch_id}")))?;
    Ok(Json(view))
}

/// `POST /callback/{batch_id}/{task_id}`: worker terminal reports.
///
/// Responds 200 once the callback has been folded or idempotently dropped;
/// 4xx only on a malformed path or body.
async fn post_callback(
    State(state): State<Arc<AppState>>,
    Path((batch_id, task_id)): Path<(String, String)>,
    payload: Result<Json<CallbackPayload>, JsonRejection>,
) -> ApiResult<Json<OkResponse>> {
    let batch_id = parse_batch_id(&batch_id)?;
    let Json(payload) = payload
        .map_err(|e| ApiError::bad_request(format!("malformed callback payload: {e}")))?;

    state
        .orchestrator
        .handle_callback(&batch_id, &task_id, &payload)
        .await?;

    Ok(Json(OkResponse {
        ok: true,
        message: None,
    }))
}

/// `POST /admin/reset/{batch_id}`: force terminal failure.
async fn admin_reset(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<OkResponse>> {
    let batch_id = parse_batch_id(&batch_id)?;
    state.orchestrator.admin_reset(&batch_id).await?;
    Ok(Json(OkResponse {
        ok: true,
        message: Some("Batch reset".to_string()),
    }))
}

/// `POST /queue/batch`: delivery of a batch message from the queue
/// substrate.
///
/// A 5xx response signals the queue to redeliver; duplicates are dropped
/// with a 200 so redelivery converges.
async fn queue_batch(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BatchMessage>, JsonRejection>,
) -> ApiResult<Json<OkResponse>> {
    let Json(message) =
        payload.map_err(|e| ApiError::bad_request(format!("malformed batch message: {e}")))?;

    state.orchestrator.start_batch(message).await?;
    Ok(Json(OkResponse {
        ok: true,
        message: None,
    }))
}

// ============================================================================
// Server
// ============================================================================

/// Builder for [`Server`], allowing tests to inject collaborators.
#[derive(Default)]
pub struct ServerBuilder {
    config: Config,
    storage: Option<Arc<dyn StorageBackend>>,
    spawner: Option<Arc<dyn MachineSpawner>>,
    notifier: Option<Arc<dyn DownstreamNotifier>>,
}

impl ServerBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the full configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Toggles debug mode.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Provides an explicit storage backend.
    #[must_use]
    pub fn storage_backend(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Provides an explicit machine spawner.
    #[must_use]
    pub fn spawner(mut self, spawner: Arc<dyn MachineSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Provides an explicit downstream notifier.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn DownstreamNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Builds the server.
    ///
    /// # Errors
    ///
    /// Returns an error if no spawner was provided and one cannot be built
    /// from the configuration.
    pub fn build(self) -> FlowResult<Server> {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));

        let spawner: Arc<dyn MachineSpawner> = match self.spawner {
            Some(spawner) => spawner,
            None if self.config.debug => {
                tracing::warn!("debug mode without a spawner: machines will not actually start");
                Arc::new(MockSpawner::new())
            }
            None => Arc::new(FlyMachineSpawner::new(&self.config.orchestrator)?),
        };

        let notifier: Arc<dyn DownstreamNotifier> = match self.notifier {
            Some(notifier) => notifier,
            None => match &self.config.notify_url {
                Some(url) => Arc::new(HttpNotifier::new(
                    url.clone(),
                    self.config.notify_token.clone(),
                )?),
                None => Arc::new(NoopNotifier),
            },
        };

        let store = Arc::new(DocumentStore::new(Arc::clone(&storage)));
        let orchestrator = Orchestrator::new(
            self.config.orchestrator.clone(),
            store,
            spawner,
            notifier,
        );

        Ok(Server {
            state: Arc::new(AppState {
                config: self.config,
                orchestrator,
                storage,
            }),
        })
    }
}

/// The Platen API server.
pub struct Server {
    state: Arc<AppState>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .finish()
    }
}

impl Server {
    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Returns the orchestrator (for tests and operational tooling).
    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.state.orchestrator
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self) -> Router {
        let cors = build_cors_layer(&self.state.config.cors);

        Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/status/:batch_id", get(get_status))
            .route("/callback/:batch_id/:task_id", post(post_callback))
            .route("/admin/reset/:batch_id", post(admin_reset))
            .route("/queue/batch", post(queue_batch))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Returns a router suitable for in-process testing.
    #[must_use]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }

    /// Starts the server and blocks until shutdown.
    ///
    /// Recovers in-flight batches from the durable store before accepting
    /// requests.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid or the listener cannot
    /// bind.
    pub async fn serve(&self) -> FlowResult<()> {
        self.state
            .config
            .validate()
            .map_err(|e| FlowError::configuration(e.to_string()))?;

        let recovered = self.state.orchestrator.recover().await?;
        if recovered > 0 {
            tracing::info!(recovered, "recovered in-flight batches");
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.create_router();

        tracing::info!(http_port = self.state.config.http_port, "starting Platen API server");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| FlowError::configuration(format!("failed to bind to {addr}: {e}")))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| FlowError::configuration(format!("server error: {e}")))?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}

/// Builds the CORS layer from configuration.
///
/// Empty origin list disables CORS; `*` allows any origin. The surface
/// only ever serves `GET` and `POST`.
fn build_cors_layer(config: &CorsConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .max_age(Duration::from_secs(config.max_age_seconds));

    if config.allowed_origins.is_empty() {
        return cors;
    }

    if config.allowed_origins.iter().any(|origin| origin == "*") {
        if config.allowed_origins.len() > 1 {
            tracing::error!(
                origins = ?config.allowed_origins,
                "invalid CORS config: '*' must be the only allowed origin"
            );
            return cors;
        }
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if allowed.is_empty() {
        tracing::warn!("all configured CORS origins were invalid; disabling CORS");
        cors
    } else {
        cors.allow_origin(AllowOrigin::list(allowed))
    }
}
