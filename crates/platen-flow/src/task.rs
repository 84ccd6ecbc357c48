//! Task lifecycle and worker callback payloads.
//!
//! A task is the per-file unit of work within a phase. Its identity is a
//! pure function of `(batch_id, phase_tag, input_key)`, so respawning a task
//! re-uses the same id and late worker reports fold idempotently.
//!
//! ```text
//! pending ── spawn ok ──► processing ── callback success ─► completed
//!    ▲                        │
//!    │                        ├── callback error (budget left) ──► pending
//!    └── spawn error          └── callback error (exhausted)  ──► failed
//!        (stays pending)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use platen_core::BatchId;

use crate::error::{Error, Result};

/// Task execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a spawn slot.
    Pending,
    /// A worker machine is (believed to be) running this task.
    Processing,
    /// Worker reported success.
    Completed,
    /// Worker errors exhausted the task's retry budget.
    Failed,
}

impl TaskStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if a transition out of this status is valid.
    ///
    /// Terminal statuses are absorbing; every transition between
    /// non-terminal statuses is legal. `Processing -> Pending` is the
    /// worker-error respawn path, and a callback may fold a terminal
    /// outcome onto a `Pending` task when a worker's report races the task
    /// being reset for respawn; the report still wins.
    #[must_use]
    pub const fn can_transition(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Worker-reported timing breakdown for a completed task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPerformance {
    /// Wall-clock duration of the whole task in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Time spent downloading the input in milliseconds.
    #[serde(default)]
    pub download_ms: u64,
    /// Time spent transforming in milliseconds.
    #[serde(default)]
    pub convert_ms: u64,
    /// Time spent uploading the output in milliseconds.
    #[serde(default)]
    pub upload_ms: u64,
}

/// Per-file unit of work within a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Deterministic identity: `{batch_id}:{phase_tag}:{hash(input_key)}`.
    pub task_id: String,
    /// Execution status.
    pub status: TaskStatus,
    /// Worker-reported errors consumed so far. Spawn failures do not count.
    pub retry_count: u32,
    /// When the current attempt was spawned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent worker-reported error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque handle of the machine running the current attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_handle: Option<String>,
    /// Object-store key of the input file.
    pub input_key: String,
    /// Bare input file name.
    pub input_name: String,
    /// Object-store key of the transformed output, once reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    /// Output file name, once reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    /// Output size in bytes, once reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size: Option<u64>,
    /// Worker-reported timing breakdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<TaskPerformance>,
}

impl Task {
    /// Creates a pending task for an input file.
    #[must_use]
    pub fn new(task_id: String, input_key: String, input_name: String) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            error: None,
            machine_handle: None,
            input_key,
            input_name,
            output_key: None,
            output_name: None,
            output_size: None,
            performance: None,
        }
    }

    /// Returns true if the task is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transitions to a new status, validating the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTaskTransition`] if the transition is not
    /// part of the task lifecycle.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<()> {
        if !self.status.can_transition() {
            return Err(Error::InvalidTaskTransition {
                task_id: self.task_id.clone(),
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// Records a successful spawn: the task is now processing on `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is not pending.
    pub fn mark_spawned(&mut self, handle: String, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(TaskStatus::Processing)?;
        self.started_at = Some(now);
        self.machine_handle = Some(handle);
        Ok(())
    }

    /// Resets a processing task to pending for respawn after a worker error.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is terminal.
    pub fn reset_for_respawn(&mut self, error: String) -> Result<()> {
        self.transition_to(TaskStatus::Pending)?;
        self.retry_count += 1;
        self.error = Some(error);
        self.machine_handle = None;
        self.started_at = None;
        Ok(())
    }
}

/// Terminal report posted by a worker to
/// `POST /callback/{batch_id}/{task_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CallbackPayload {
    /// The worker transformed its file and uploaded the output.
    Success {
        /// Task id echoed by the worker.
        task_id: String,
        /// Batch id echoed by the worker.
        batch_id: BatchId,
        /// Object-store key of the output.
        output_r2_key: String,
        /// Output file name.
        output_file_name: String,
        /// Output size in bytes.
        #[serde(default)]
        output_file_size: u64,
        /// Optional timing breakdown.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        performance: Option<TaskPerformance>,
    },
    /// The worker failed terminally for this attempt.
    Error {
        /// Task id echoed by the worker.
        task_id: String,
        /// Batch id echoed by the worker.
        batch_id: BatchId,
        /// Worker-reported error message.
        error: String,
    },
}

impl CallbackPayload {
    /// Returns the task id the worker reported against.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::Success { task_id, .. } | Self::Error { task_id, .. } => task_id,
        }
    }
}
