//! The batch orchestrator.
//!
//! One durable singleton per batch id. The orchestrator owns the batch
//! state, drives the phase sequence, schedules alarm-triggered spawn waves,
//! folds worker callbacks, applies the retry policy, and drives terminal
//! transitions.
//!
//! ## Execution model
//!
//! Per-batch state is a single-writer serialized domain: every operation
//! that touches a [`BatchState`] (start, alarm wake, callback, status read,
//! admin reset) runs under that batch's async mutex. Different batches
//! proceed independently.
//!
//! ## Alarms
//!
//! At most one wake is outstanding per batch. Scheduling an alarm keeps
//! whichever deadline is earlier; firing clears the slot before the wake
//! runs, so the wake itself can schedule the successor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::AbortHandle;

use platen_core::BatchId;
use platen_core::observability::batch_span;

use crate::batch::{BatchState, StatusView};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::message::BatchMessage;
use crate::metrics::FlowMetrics;
use crate::notify::{BatchFinalized, DownstreamNotifier};
use crate::phase::{PhaseRegistry, ReconcileOutcome};
use crate::spawner::MachineSpawner;
use crate::store::StateStore;
use crate::task::CallbackPayload;

/// Unlocks a std mutex even if a panicking holder poisoned it.
fn relock<T>(result: std::result::Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of delivering a batch message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new batch was created and its first alarm scheduled.
    Started,
    /// The batch id already exists; the message was dropped.
    Duplicate,
}

/// What happened to a delivered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDisposition {
    /// The callback was folded into task state.
    Folded(ReconcileOutcome),
    /// No batch with this id is known; dropped.
    UnknownBatch,
    /// The batch is terminal; dropped.
    TerminalBatch,
    /// The task id is not in the current phase; dropped.
    UnknownTask,
}

/// One outstanding alarm for a batch.
struct Alarm {
    deadline: Instant,
    generation: u64,
    task: AbortHandle,
}

/// Per-batch serialized execution domain.
struct BatchHandle {
    state: tokio::sync::Mutex<BatchState>,
    alarm: Mutex<Option<Alarm>>,
    alarm_generation: std::sync::atomic::AtomicU64,
}

impl BatchHandle {
    fn new(state: BatchState) -> Self {
        Self {
            state: tokio::sync::Mutex::new(state),
            alarm: Mutex::new(None),
            alarm_generation: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

struct Inner {
    config: OrchestratorConfig,
    store: Arc<dyn StateStore>,
    spawner: Arc<dyn MachineSpawner>,
    notifier: Arc<dyn DownstreamNotifier>,
    registry: PhaseRegistry,
    batches: Mutex<HashMap<BatchId, Arc<BatchHandle>>>,
    metrics: FlowMetrics,
}

/// The per-batch supervisor. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over the given collaborators.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn StateStore>,
        spawner: Arc<dyn MachineSpawner>,
        notifier: Arc<dyn DownstreamNotifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                spawner,
                notifier,
                registry: PhaseRegistry,
                batches: Mutex::new(HashMap::new()),
                metrics: FlowMetrics::new(),
            }),
        }
    }

    /// Returns the shared configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Externally callable operations
    // ------------------------------------------------------------------

    /// Handles delivery of a batch message. Idempotent per batch id.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial snapshot cannot be persisted; the
    /// queue substrate should redeliver.
    #[tracing::instrument(skip_all, fields(batch_id = %message.batch_id))]
    pub async fn start_batch(&self, message: BatchMessage) -> Result<StartOutcome> {
        let batch_id = message.batch_id.clone();

        if self.lookup(&batch_id).is_some() {
            tracing::info!(batch_id = %batch_id, "duplicate batch message; dropping");
            return Ok(StartOutcome::Duplicate);
        }
        if let Some(existing) = self.inner.store.get_batch(&batch_id).await? {
            tracing::info!(batch_id = %batch_id, status = %existing.status, "batch already persisted; dropping message");
            self.install(existing);
            return Ok(StartOutcome::Duplicate);
        }

        let initial = self.inner.registry.initial();
        let tasks = self.inner.registry.get(initial).discover(&message);
        let now = Utc::now();
        let state = BatchState::new(message, initial, tasks, now);
        tracing::info!(
            batch_id = %batch_id,
            phase = %initial,
            tasks_total = state.tasks_total,
            "batch created"
        );

        let handle = {
            let mut batches = relock(self.inner.batches.lock());
            if batches.contains_key(&batch_id) {
                return Ok(StartOutcome::Duplicate);
            }
            let handle = Arc::new(BatchHandle::new(state));
            batches.insert(batch_id.clone(), Arc::clone(&handle));
            self.inner.metrics.set_active_batches(batches.len());
            handle
        };

        let persisted = {
            let mut state = handle.state.lock().await;
            if state.tasks_total == 0 {
                self.advance_phase(&batch_id, &handle, &mut state);
            }
            self.inner.store.save_batch(&state).await
        };
        if let Err(err) = persisted {
            // Roll back the in-memory entry so a redelivery starts clean.
            let mut batches = relock(self.inner.batches.lock());
            batches.remove(&batch_id);
            self.inner.metrics.set_active_batches(batches.len());
            return Err(err);
        }

        if !self.is_terminal(&handle).await {
            self.schedule_alarm(&batch_id, &handle, Duration::ZERO);
        }
        Ok(StartOutcome::Started)
    }

    /// Folds a worker callback into batch state.
    ///
    /// Unknown batches, terminal batches, and unknown task ids are dropped:
    /// late or duplicate reports are expected after resets and retries, and
    /// the worker gets a 200 either way.
    ///
    /// # Errors
    ///
    /// Returns an error on an internal invariant violation (the batch is
    /// marked `ERROR`) or if the snapshot cannot be persisted.
    #[tracing::instrument(skip_all, fields(batch_id = %batch_id, task_id))]
    pub async fn handle_callback(
        &self,
        batch_id: &BatchId,
        task_id: &str,
        payload: &CallbackPayload,
    ) -> Result<CallbackDisposition> {
        let Some(handle) = self.handle_or_load(batch_id).await? else {
            tracing::warn!(batch_id = %batch_id, task_id, "callback for unknown batch; dropping");
            return Ok(CallbackDisposition::UnknownBatch);
        };

        let mut state = handle.state.lock().await;
        if state.is_terminal() {
            tracing::info!(
                batch_id = %batch_id,
                task_id,
                status = %state.status,
                "callback after terminal status; dropping"
            );
            self.inner.metrics.record_callback("dropped");
            return Ok(CallbackDisposition::TerminalBatch);
        }
        if !state.current_phase_tasks.contains_key(task_id) {
            tracing::warn!(batch_id = %batch_id, task_id, "callback for unknown task; dropping");
            self.inner.metrics.record_callback("dropped");
            return Ok(CallbackDisposition::UnknownTask);
        }

        let phase = self.inner.registry.get(state.current_phase);
        let outcome = match phase.reconcile_callback(task_id, payload, &mut state, &self.inner.config)
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(batch_id = %batch_id, task_id, error = %err, "callback reconciliation violated an invariant");
                self.fail_batch(&handle, &mut state, format!("internal error: {err}"))
                    .await;
                return Err(err);
            }
        };

        match outcome {
            ReconcileOutcome::Completed => self.inner.metrics.record_callback("completed"),
            ReconcileOutcome::Respawned => self.inner.metrics.record_callback("respawned"),
            ReconcileOutcome::Failed => self.inner.metrics.record_callback("failed"),
            ReconcileOutcome::Dropped => self.inner.metrics.record_callback("dropped"),
        }

        if outcome.progressed() {
            state.retry_count = 0;
            if state.all_tasks_terminal() {
                self.advance_phase(batch_id, &handle, &mut state);
            } else if outcome == ReconcileOutcome::Respawned {
                // Pick the respawned pending up promptly.
                self.schedule_alarm(batch_id, &handle, Duration::ZERO);
            }
            state.updated_at = Utc::now();
            self.inner.store.save_batch(&state).await?;
        }

        Ok(CallbackDisposition::Folded(outcome))
    }

    /// Returns the read-only status snapshot for a batch.
    ///
    /// Falls back to the durable store for batches not currently tracked
    /// in memory (evicted or terminal before a restart).
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_status(&self, batch_id: &BatchId) -> Result<Option<StatusView>> {
        if let Some(handle) = self.lookup(batch_id) {
            let state = handle.state.lock().await;
            return Ok(Some(state.status_view()));
        }
        Ok(self
            .inner
            .store
            .get_batch(batch_id)
            .await?
            .map(|s| s.status_view()))
    }

    /// Forces a batch into terminal failure.
    ///
    /// The current phase's task map is preserved for audit; in-flight
    /// workers are not killed, their late callbacks are dropped because the
    /// status is terminal. Resetting an already-terminal batch is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchNotFound`] for an unknown id, or a storage
    /// error if the snapshot cannot be persisted.
    #[tracing::instrument(skip_all, fields(batch_id = %batch_id))]
    pub async fn admin_reset(&self, batch_id: &BatchId) -> Result<()> {
        let Some(handle) = self.handle_or_load(batch_id).await? else {
            return Err(Error::BatchNotFound {
                batch_id: batch_id.clone(),
            });
        };

        let mut state = handle.state.lock().await;
        self.cancel_alarm(&handle);
        if state.is_terminal() {
            tracing::info!(batch_id = %batch_id, status = %state.status, "reset of terminal batch is a no-op");
            return Ok(());
        }

        tracing::warn!(batch_id = %batch_id, "batch reset by admin");
        state.mark_error("reset by admin", Utc::now());
        self.inner.metrics.record_batch_terminal("ERROR");
        self.inner.store.save_batch(&state).await?;
        Ok(())
    }

    /// Re-arms alarms for every persisted non-terminal batch.
    ///
    /// Call once at startup. Returns the number of batches recovered.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed or read.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for batch_id in self.inner.store.list_batch_ids().await? {
            if self.lookup(&batch_id).is_some() {
                continue;
            }
            let Some(state) = self.inner.store.get_batch(&batch_id).await? else {
                continue;
            };
            if state.is_terminal() {
                continue;
            }
            tracing::info!(
                batch_id = %batch_id,
                status = %state.status,
                retry_count = state.retry_count,
                "recovering in-flight batch"
            );
            let handle = self.install(state);
            self.schedule_alarm(&batch_id, &handle, Duration::ZERO);
            recovered += 1;
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // Alarm loop
    // ------------------------------------------------------------------

    /// Schedules a wake for a batch, keeping the earlier of the new and any
    /// already-outstanding deadline.
    fn schedule_alarm(&self, batch_id: &BatchId, handle: &Arc<BatchHandle>, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut slot = relock(handle.alarm.lock());

        if let Some(existing) = slot.as_ref() {
            if existing.deadline <= deadline && !existing.task.is_finished() {
                return;
            }
            existing.task.abort();
        }

        let generation = handle
            .alarm_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        let orchestrator = self.clone();
        let id = batch_id.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            orchestrator.fire_alarm(id, generation).await;
        });
        *slot = Some(Alarm {
            deadline,
            generation,
            task: join.abort_handle(),
        });
    }

    /// Cancels any outstanding wake for a batch.
    fn cancel_alarm(&self, handle: &Arc<BatchHandle>) {
        let mut slot = relock(handle.alarm.lock());
        if let Some(alarm) = slot.take() {
            alarm.task.abort();
        }
    }

    /// Entry point of a fired alarm task.
    ///
    /// Clears only its own slot entry: a wake that lost its slot to a
    /// later-scheduled alarm still runs (it was not aborted), but must not
    /// discard the successor's registration.
    async fn fire_alarm(self, batch_id: BatchId, generation: u64) {
        let Some(handle) = self.lookup(&batch_id) else {
            return;
        };
        {
            let mut slot = relock(handle.alarm.lock());
            if slot.as_ref().is_some_and(|alarm| alarm.generation == generation) {
                *slot = None;
            }
        }

        if let Err(err) = self.on_alarm(&batch_id, &handle).await {
            // Persistence failed; in-memory state is authoritative, retry
            // the snapshot on the next wake.
            tracing::error!(batch_id = %batch_id, error = %err, "alarm wake failed");
            if !self.is_terminal(&handle).await {
                self.schedule_alarm(&batch_id, &handle, self.inner.config.alarm_delay_error_retry);
            }
        }
    }

    /// One alarm wake: execute a spawn wave, then transition or reschedule.
    #[tracing::instrument(skip_all, fields(batch_id = %batch_id))]
    async fn on_alarm(&self, batch_id: &BatchId, handle: &Arc<BatchHandle>) -> Result<()> {
        let started = Instant::now();

        let mut state = handle.state.lock().await;
        if state.is_terminal() {
            return Ok(());
        }

        let phase = self.inner.registry.get(state.current_phase);
        let outcome = match phase
            .execute_batch(&mut state, &self.inner.config, self.inner.spawner.as_ref())
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(batch_id = %batch_id, error = %err, "spawn wave violated an invariant");
                self.fail_batch(handle, &mut state, format!("internal error: {err}"))
                    .await;
                return Ok(());
            }
        };

        self.inner
            .metrics
            .record_spawns("ok", outcome.spawned as u64);
        self.inner
            .metrics
            .record_spawns("error", outcome.spawn_errors as u64);
        tracing::debug!(
            batch_id = %batch_id,
            spawned = outcome.spawned,
            spawn_errors = outcome.spawn_errors,
            more_work = outcome.more_work,
            "spawn wave done"
        );

        if outcome.more_work {
            if outcome.did_spawn_any() {
                state.retry_count = 0;
                self.schedule_alarm(batch_id, handle, self.inner.config.alarm_delay);
            } else {
                // Nothing progressed: spawn errors, or only waiting on
                // callbacks. Burn one unit of the no-progress budget.
                state.retry_count += 1;
                if state.retry_count > self.inner.config.max_retry_attempts {
                    tracing::error!(
                        batch_id = %batch_id,
                        retry_count = state.retry_count,
                        "no progress across retry budget; failing batch"
                    );
                    state.mark_error("retry budget exhausted", Utc::now());
                    self.cancel_alarm(handle);
                    self.inner.metrics.record_batch_terminal("ERROR");
                } else {
                    let delay = backoff_delay(&self.inner.config, state.retry_count);
                    tracing::info!(
                        batch_id = %batch_id,
                        retry_count = state.retry_count,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "no progress this wake; backing off"
                    );
                    self.schedule_alarm(batch_id, handle, delay);
                }
            }
        } else {
            self.advance_phase(batch_id, handle, &mut state);
        }

        state.updated_at = Utc::now();
        self.inner.store.save_batch(&state).await?;
        self.inner.metrics.observe_alarm_duration(started);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Advances past the current phase: installs successors (cascading over
    /// empty discoveries) or finalizes the batch.
    ///
    /// Caller persists the state afterwards.
    fn advance_phase(&self, batch_id: &BatchId, handle: &Arc<BatchHandle>, state: &mut BatchState) {
        let span = batch_span("advance_phase", batch_id.as_str());
        let _guard = span.enter();
        loop {
            let phase = self.inner.registry.get(state.current_phase);
            match phase.next_phase() {
                None => {
                    let now = Utc::now();
                    state.mark_done(now);
                    self.cancel_alarm(handle);
                    self.inner.metrics.record_batch_terminal("DONE");
                    tracing::info!(
                        batch_id = %batch_id,
                        tasks_total = state.tasks_total,
                        tasks_completed = state.tasks_completed,
                        tasks_failed = state.tasks_failed,
                        "batch done"
                    );

                    let payload = BatchFinalized::from_state(state);
                    let notifier = Arc::clone(&self.inner.notifier);
                    tokio::spawn(async move {
                        notifier.notify(&payload).await;
                    });
                    return;
                }
                Some(tag) => {
                    let tasks = self.inner.registry.get(tag).discover(&state.queue_message);
                    let empty = tasks.is_empty();
                    tracing::info!(
                        batch_id = %batch_id,
                        phase = %tag,
                        tasks = tasks.len(),
                        "phase transition"
                    );
                    state.install_phase(tag, tasks, Utc::now());
                    if empty {
                        continue;
                    }
                    self.schedule_alarm(batch_id, handle, Duration::ZERO);
                    return;
                }
            }
        }
    }

    /// Marks a batch failed after an invariant violation and persists the
    /// snapshot on a best-effort basis.
    async fn fail_batch(&self, handle: &Arc<BatchHandle>, state: &mut BatchState, error: String) {
        state.mark_error(error, Utc::now());
        self.cancel_alarm(handle);
        self.inner.metrics.record_batch_terminal("ERROR");
        if let Err(err) = self.inner.store.save_batch(state).await {
            tracing::error!(batch_id = %state.batch_id, error = %err, "failed to persist ERROR snapshot");
        }
    }

    // ------------------------------------------------------------------
    // Handle bookkeeping
    // ------------------------------------------------------------------

    fn lookup(&self, batch_id: &BatchId) -> Option<Arc<BatchHandle>> {
        relock(self.inner.batches.lock()).get(batch_id).cloned()
    }

    /// Installs a loaded state, returning the (possibly pre-existing)
    /// handle.
    fn install(&self, state: BatchState) -> Arc<BatchHandle> {
        let mut batches = relock(self.inner.batches.lock());
        let handle = batches
            .entry(state.batch_id.clone())
            .or_insert_with(|| Arc::new(BatchHandle::new(state)))
            .clone();
        self.inner.metrics.set_active_batches(batches.len());
        handle
    }

    /// Resolves a handle, lazily loading from the store.
    ///
    /// A lazily-loaded non-terminal batch gets a standard alarm so progress
    /// resumes even if recovery never saw it.
    async fn handle_or_load(&self, batch_id: &BatchId) -> Result<Option<Arc<BatchHandle>>> {
        if let Some(handle) = self.lookup(batch_id) {
            return Ok(Some(handle));
        }
        let Some(state) = self.inner.store.get_batch(batch_id).await? else {
            return Ok(None);
        };
        let terminal = state.is_terminal();
        let handle = self.install(state);
        if !terminal {
            self.schedule_alarm(batch_id, &handle, self.inner.config.alarm_delay);
        }
        Ok(Some(handle))
    }

    async fn is_terminal(&self, handle: &Arc<BatchHandle>) -> bool {
        handle.state.lock().await.is_terminal()
    }
}

/// Delay before the next no-progress wake: exponential from the error-retry
/// delay, capped at the configured ceiling.
fn backoff_delay(config: &OrchestratorConfig, retry_count: u32) -> Duration {
    let shift = retry_count.saturating_sub(1).min(16);
    config
        .alarm_delay_error_retry
        .saturating_mul(1_u32 << shift)
        .min(config.max_alarm_delay)
}
