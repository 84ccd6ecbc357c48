//! Observability infrastructure for Platen.
//!
//! Structured logging with consistent spans. This module provides the
//! initialization helper and span constructors used across components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `platen_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for batch orchestration operations.
///
/// # Example
///
/// ```rust
/// use platen_core::observability::batch_span;
///
/// let span = batch_span("alarm_wake", "B1");
/// let _guard = span.enter();
/// // ... advance the batch
/// ```
#[must_use]
pub fn batch_span(operation: &str, batch_id: &str) -> Span {
    tracing::info_span!("batch", op = operation, batch_id = batch_id)
}
