//! The phase abstraction.
//!
//! A phase is one stage of the preprocessing pipeline with four
//! responsibilities:
//!
//! 1. **discover**: derive the phase's task set from the batch message
//! 2. **execute**: advance pending tasks by issuing bounded spawn waves
//! 3. **reconcile**: fold a worker's terminal report into task state
//! 4. **successor**: name the phase that follows, or end the batch
//!
//! Spawning and reconciliation work the same way for every phase, so the
//! trait provides them; a concrete phase contributes its tag, its discovery
//! predicate, and its successor. [`PhaseRegistry`] maps tags to the closed
//! set of implementations.

pub mod tiff;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use platen_core::BatchId;

use crate::batch::BatchState;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::spawner::{MachineSpawner, MachineSpec, machine_name};
use crate::task::{CallbackPayload, Task, TaskStatus};

pub use tiff::TiffConversionPhase;

/// Tag identifying a phase. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseTag {
    /// TIFF to JPEG conversion.
    TiffConversion,
}

impl PhaseTag {
    /// Returns the wire label (`TIFF_CONVERSION`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TiffConversion => "TIFF_CONVERSION",
        }
    }
}

impl std::fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one execute wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct ExecuteOutcome {
    /// True while any task is still pending or processing.
    pub more_work: bool,
    /// Number of spawns that succeeded this wave.
    pub spawned: usize,
    /// Number of spawns that failed this wave (tasks left pending).
    pub spawn_errors: usize,
}

impl ExecuteOutcome {
    /// True if at least one spawn succeeded this wave.
    #[must_use]
    pub const fn did_spawn_any(&self) -> bool {
        self.spawned > 0
    }
}

/// What a callback reconciliation did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The task completed; outputs recorded.
    Completed,
    /// Worker error with budget remaining; task reset to pending.
    Respawned,
    /// Worker error exhausted the budget; task failed.
    Failed,
    /// The task was already terminal; nothing changed.
    Dropped,
}

impl ReconcileOutcome {
    /// Returns true if the reconciliation mutated task state.
    #[must_use]
    pub const fn progressed(&self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

/// A pipeline stage.
///
/// Implementations contribute identity, discovery, and succession; the
/// execute and reconcile machinery is shared.
#[async_trait]
pub trait Phase: Send + Sync {
    /// This phase's tag.
    fn tag(&self) -> PhaseTag;

    /// Derives the phase's task set from the batch message.
    ///
    /// Deterministic and free of I/O: the same message always yields the
    /// same task ids.
    fn discover(&self, message: &crate::message::BatchMessage) -> Vec<Task>;

    /// The phase that follows this one, or `None` if the batch is done
    /// after this phase.
    fn next_phase(&self) -> Option<PhaseTag>;

    /// Worker-reported errors a task may consume before it fails.
    fn max_task_retries(&self, config: &OrchestratorConfig) -> u32 {
        config.max_retry_attempts
    }

    /// Builds the spawn request for one task.
    fn machine_spec(
        &self,
        task: &Task,
        batch_id: &BatchId,
        config: &OrchestratorConfig,
    ) -> MachineSpec {
        let mut env = BTreeMap::new();
        env.insert("TASK_ID".to_string(), task.task_id.clone());
        env.insert("BATCH_ID".to_string(), batch_id.to_string());
        env.insert("INPUT_R2_KEY".to_string(), task.input_key.clone());
        env.insert("INPUT_FILE_NAME".to_string(), task.input_name.clone());
        env.insert(
            "R2_ACCOUNT_ID".to_string(),
            config.object_store.account_id.clone(),
        );
        env.insert(
            "R2_ACCESS_KEY_ID".to_string(),
            config.object_store.access_key_id.clone(),
        );
        env.insert(
            "R2_SECRET_ACCESS_KEY".to_string(),
            config.object_store.secret_access_key.clone(),
        );
        env.insert("R2_BUCKET".to_string(), config.object_store.bucket.clone());
        env.insert(
            "CALLBACK_URL".to_string(),
            config.callback_url(batch_id.as_str(), &task.task_id),
        );

        MachineSpec {
            name: machine_name(&task.task_id),
            region: config.fly.region.clone(),
            image: config.fly.worker_image.clone(),
            env,
            guest: config.worker.clone(),
        }
    }

    /// Advances pending tasks by one bounded spawn wave.
    ///
    /// Selects at most `batch_size` pending tasks (lexicographic by task
    /// id), fans the spawn requests out concurrently, and records results.
    /// A failed spawn leaves its task pending and untouched; transient
    /// machine-API errors must not consume the task's retry budget.
    ///
    /// # Errors
    ///
    /// Returns an error only on a task-lifecycle invariant violation.
    async fn execute_batch(
        &self,
        state: &mut BatchState,
        config: &OrchestratorConfig,
        spawner: &dyn MachineSpawner,
    ) -> Result<ExecuteOutcome> {
        let selected = state.pending_task_ids(config.batch_size);
        let mut spawned = 0;
        let mut spawn_errors = 0;

        if !selected.is_empty() {
            let specs: Vec<MachineSpec> = selected
                .iter()
                .filter_map(|id| state.current_phase_tasks.get(id))
                .map(|task| self.machine_spec(task, &state.batch_id, config))
                .collect();

            let results =
                futures::future::join_all(specs.iter().map(|spec| spawner.spawn(spec))).await;

            let now = Utc::now();
            for (task_id, result) in selected.iter().zip(results) {
                let Some(task) = state.current_phase_tasks.get_mut(task_id) else {
                    continue;
                };
                match result {
                    Ok(handle) => {
                        task.mark_spawned(handle, now)?;
                        spawned += 1;
                    }
                    Err(err) => {
                        spawn_errors += 1;
                        tracing::warn!(
                            batch_id = %state.batch_id,
                            task_id = %task_id,
                            transient = err.is_transient(),
                            error = %err,
                            "spawn failed; task stays pending"
                        );
                    }
                }
            }
        }

        Ok(ExecuteOutcome {
            more_work: !state.all_tasks_terminal(),
            spawned,
            spawn_errors,
        })
    }

    /// Folds a worker's terminal report into task state. Idempotent.
    ///
    /// A report for an already-terminal task is dropped without touching
    /// counters. Success records outputs and bumps `tasks_completed`; an
    /// error consumes one unit of the task's retry budget, resetting it to
    /// pending until the budget is exhausted, then failing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if the task id is not in the current
    /// phase, or an invariant error on an invalid transition.
    fn reconcile_callback(
        &self,
        task_id: &str,
        payload: &CallbackPayload,
        state: &mut BatchState,
        config: &OrchestratorConfig,
    ) -> Result<ReconcileOutcome> {
        let max_retries = self.max_task_retries(config);
        let Some(task) = state.current_phase_tasks.get_mut(task_id) else {
            return Err(Error::TaskNotFound {
                task_id: task_id.to_string(),
            });
        };

        if task.is_terminal() {
            return Ok(ReconcileOutcome::Dropped);
        }

        match payload {
            CallbackPayload::Success {
                output_r2_key,
                output_file_name,
                output_file_size,
                performance,
                ..
            } => {
                task.transition_to(TaskStatus::Completed)?;
                task.output_key = Some(output_r2_key.clone());
                task.output_name = Some(output_file_name.clone());
                task.output_size = Some(*output_file_size);
                task.performance = performance.clone();
                task.completed_at = Some(Utc::now());
                task.error = None;
                state.tasks_completed += 1;
                Ok(ReconcileOutcome::Completed)
            }
            CallbackPayload::Error { error, .. } => {
                if task.retry_count + 1 >= max_retries {
                    task.retry_count += 1;
                    task.transition_to(TaskStatus::Failed)?;
                    task.error = Some(error.clone());
                    task.completed_at = Some(Utc::now());
                    state.tasks_failed += 1;
                    Ok(ReconcileOutcome::Failed)
                } else {
                    task.reset_for_respawn(error.clone())?;
                    Ok(ReconcileOutcome::Respawned)
                }
            }
        }
    }
}

/// Registry over the closed set of phases.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseRegistry;

impl PhaseRegistry {
    /// The phase a new batch starts in.
    #[must_use]
    pub const fn initial(&self) -> PhaseTag {
        PhaseTag::TiffConversion
    }

    /// Resolves a tag to its implementation. Total over the closed set.
    #[must_use]
    pub fn get(&self, tag: PhaseTag) -> &'static dyn Phase {
        match tag {
            PhaseTag::TiffConversion => &TiffConversionPhase,
        }
    }
}
