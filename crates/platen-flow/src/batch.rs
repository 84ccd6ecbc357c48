//! Durable per-batch control state.
//!
//! One [`BatchState`] exists per batch id. It is the only thing Platen
//! persists: the original queue message, the current phase's task map, and
//! the running counters pollers observe through [`StatusView`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use platen_core::BatchId;

use crate::message::BatchMessage;
use crate::phase::PhaseTag;
use crate::task::{Task, TaskStatus};

/// Batch status: the active phase tag, or a terminal marker.
///
/// Closed set. Adding a phase means adding a variant here, a [`PhaseTag`]
/// variant, and a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// The TIFF conversion phase is active.
    TiffConversion,
    /// Every phase ran; all tasks reached a terminal status.
    Done,
    /// The batch failed: admin reset, retry exhaustion, or invariant
    /// violation.
    Error,
}

impl BatchStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Returns the phase tag when the status names an active phase.
    #[must_use]
    pub const fn phase_tag(&self) -> Option<PhaseTag> {
        match self {
            Self::TiffConversion => Some(PhaseTag::TiffConversion),
            Self::Done | Self::Error => None,
        }
    }

    /// Returns the wire label (`TIFF_CONVERSION`, `DONE`, `ERROR`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TiffConversion => "TIFF_CONVERSION",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }
}

impl From<PhaseTag> for BatchStatus {
    fn from(tag: PhaseTag) -> Self {
        match tag {
            PhaseTag::TiffConversion => Self::TiffConversion,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable control state for one batch.
///
/// Mutated only by the orchestrator that owns the batch id; every mutation
/// is followed by a persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    /// Stable identity; the persistence key.
    pub batch_id: BatchId,
    /// Active phase tag or terminal marker.
    pub status: BatchStatus,
    /// The original batch descriptor, immutable once set.
    pub queue_message: BatchMessage,
    /// The active phase.
    pub current_phase: PhaseTag,
    /// Tasks of the active phase, keyed by task id.
    ///
    /// Preserved on admin reset for audit; a `BTreeMap` keeps selection
    /// order deterministic (lexicographic by task id).
    pub current_phase_tasks: BTreeMap<String, Task>,
    /// Running total of tasks discovered across all phases.
    pub tasks_total: u64,
    /// Tasks that reached `completed`, summed across phases. Monotonic.
    pub tasks_completed: u64,
    /// Tasks that reached `failed`, summed across phases. Monotonic.
    pub tasks_failed: u64,
    /// When the batch was created.
    pub started_at: DateTime<Utc>,
    /// When the orchestrator last acted on the batch.
    pub updated_at: DateTime<Utc>,
    /// When the batch reached `DONE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Batch-level error, set iff status is `ERROR`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Consecutive no-progress alarm wakes since the last progress.
    pub retry_count: u32,
}

impl BatchState {
    /// Creates the initial state for a batch with the first phase's tasks
    /// already discovered.
    #[must_use]
    pub fn new(
        queue_message: BatchMessage,
        first_phase: PhaseTag,
        tasks: Vec<Task>,
        now: DateTime<Utc>,
    ) -> Self {
        let batch_id = queue_message.batch_id.clone();
        let tasks_total = tasks.len() as u64;
        let current_phase_tasks = tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect();

        Self {
            batch_id,
            status: first_phase.into(),
            queue_message,
            current_phase: first_phase,
            current_phase_tasks,
            tasks_total,
            tasks_completed: 0,
            tasks_failed: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            retry_count: 0,
        }
    }

    /// Returns true if the batch is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if every task of the current phase is terminal.
    ///
    /// Vacuously true for an empty phase.
    #[must_use]
    pub fn all_tasks_terminal(&self) -> bool {
        self.current_phase_tasks.values().all(Task::is_terminal)
    }

    /// Returns up to `limit` pending task ids in lexicographic order.
    #[must_use]
    pub fn pending_task_ids(&self, limit: usize) -> Vec<String> {
        self.current_phase_tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .take(limit)
            .map(|t| t.task_id.clone())
            .collect()
    }

    /// Installs the task set of the next phase.
    ///
    /// Totals are a running sum across phases; the task map is replaced.
    pub fn install_phase(&mut self, tag: PhaseTag, tasks: Vec<Task>, now: DateTime<Utc>) {
        self.tasks_total += tasks.len() as u64;
        self.current_phase_tasks = tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect();
        self.current_phase = tag;
        self.status = tag.into();
        self.updated_at = now;
    }

    /// Marks the batch done.
    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.status = BatchStatus::Done;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Marks the batch failed with a batch-level error.
    pub fn mark_error(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = BatchStatus::Error;
        self.error = Some(error.into());
        self.updated_at = now;
    }

    /// Builds the read-only snapshot served to pollers.
    #[must_use]
    pub fn status_view(&self) -> StatusView {
        StatusView {
            batch_id: self.batch_id.clone(),
            status: self.status,
            current_phase: self.current_phase,
            tasks_total: self.tasks_total,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            started_at: self.started_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// Read-only snapshot of a batch, served by `GET /status/{batch_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    /// Batch identity.
    pub batch_id: BatchId,
    /// Active phase tag or terminal marker.
    pub status: BatchStatus,
    /// The active phase.
    pub current_phase: PhaseTag,
    /// Running total of tasks discovered across all phases.
    pub tasks_total: u64,
    /// Tasks completed, summed across phases.
    pub tasks_completed: u64,
    /// Tasks failed, summed across phases.
    pub tasks_failed: u64,
    /// When the batch was created.
    pub started_at: DateTime<Utc>,
    /// When the orchestrator last acted on the batch.
    pub updated_at: DateTime<Utc>,
    /// When the batch reached `DONE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Batch-level error, set iff status is `ERROR`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
