//! Observability metrics for orchestration.
//!
//! Exposed through the `metrics` crate facade; the hosting binary decides
//! how to export them.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `platen_flow_spawns_total` | Counter | `result` | Spawn requests by outcome |
//! | `platen_flow_callbacks_total` | Counter | `outcome` | Worker callbacks folded |
//! | `platen_flow_batches_total` | Counter | `status` | Batches reaching a terminal status |
//! | `platen_flow_active_batches` | Gauge | - | Batches currently tracked in memory |
//! | `platen_flow_alarm_duration_seconds` | Histogram | - | Alarm wake processing time |

use std::time::Instant;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: spawn requests by outcome.
    pub const SPAWNS_TOTAL: &str = "platen_flow_spawns_total";
    /// Counter: worker callbacks by reconcile outcome.
    pub const CALLBACKS_TOTAL: &str = "platen_flow_callbacks_total";
    /// Counter: batches reaching a terminal status.
    pub const BATCHES_TOTAL: &str = "platen_flow_batches_total";
    /// Gauge: batches currently tracked in memory.
    pub const ACTIVE_BATCHES: &str = "platen_flow_active_batches";
    /// Histogram: alarm wake processing time in seconds.
    pub const ALARM_DURATION_SECONDS: &str = "platen_flow_alarm_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Spawn result (`ok`, `transient`, `permanent`).
    pub const RESULT: &str = "result";
    /// Reconcile outcome (`completed`, `respawned`, `failed`, `dropped`).
    pub const OUTCOME: &str = "outcome";
    /// Terminal batch status (`DONE`, `ERROR`).
    pub const STATUS: &str = "status";
}

/// Recording helpers for orchestration metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates the metrics facade.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records spawn request outcomes.
    pub fn record_spawns(&self, result: &'static str, count: u64) {
        if count > 0 {
            counter!(names::SPAWNS_TOTAL, labels::RESULT => result).increment(count);
        }
    }

    /// Records one folded callback.
    pub fn record_callback(&self, outcome: &'static str) {
        counter!(names::CALLBACKS_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records a batch reaching a terminal status.
    pub fn record_batch_terminal(&self, status: &'static str) {
        counter!(names::BATCHES_TOTAL, labels::STATUS => status).increment(1);
    }

    /// Updates the active-batches gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_batches(&self, count: usize) {
        gauge!(names::ACTIVE_BATCHES).set(count as f64);
    }

    /// Records the duration of one alarm wake.
    pub fn observe_alarm_duration(&self, started: Instant) {
        histogram!(names::ALARM_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_does_not_panic_without_recorder() {
        let metrics = FlowMetrics::new();
        metrics.record_spawns("ok", 2);
        metrics.record_callback("completed");
        metrics.record_batch_terminal("DONE");
        metrics.set_active_batches(3);
        metrics.observe_alarm_duration(Instant::now());
    }
}
