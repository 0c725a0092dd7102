//! Long-running worker: phased execution with checkpoints and retries
//!
//! Execution walks three phases (initialization → processing → finalization)
//! behind the [`StagedExecutor`] seam. While a task runs, two background
//! timers publish observability: one persists checkpoints every
//! `checkpoint_interval_ms`, one emits progress events with a linear ETA
//! every `progress_interval_ms`. Failures trigger an exponential retry
//! ladder, and every failed run leaves a final checkpoint whose id rides in
//! the failed output's metadata so callers can resume later.
//!
//! Cancellation is cooperative: [`LongRunningWorker::cancel_task`] flips a
//! polled flag, takes a snapshot, and lets the executor unwind at its next
//! suspension point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::events::{SharedEventBus, SwarmEvent};
use crate::task::{estimate_tokens, Task, TaskArtifact, TaskOutput};

use super::base::WorkerBase;
use super::checkpoint::{Checkpoint, CheckpointState, SharedCheckpointStore};
use super::{
    CancelSignal, ExecutionContext, ExecutionPhase, ProgressSink, TaskExecutor, Worker,
    WorkerConfig, WorkerError, WorkerHealth, WorkerMessage, WorkerMetrics, WorkerResult,
    WorkerStatus,
};

/// Base delay for the retry ladder, scaled by `retry_backoff ^ (attempt − 1)`
const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Timing and resilience knobs for long-running execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongRunningConfig {
    /// Interval between periodic checkpoint saves
    pub checkpoint_interval_ms: u64,
    /// Interval between progress events
    pub progress_interval_ms: u64,
    /// Maximum execution attempts when auto-retry is on
    pub max_retries: u32,
    /// Exponential backoff multiplier between attempts
    pub retry_backoff: f64,
    /// Whether failed attempts are retried automatically
    pub auto_retry: bool,
    /// Per-task execution timeout; 0 disables the race
    pub task_timeout_ms: u64,
    /// Checkpoints kept per (task, worker); oldest trimmed beyond this
    pub max_checkpoints: usize,
    /// Delete a task's checkpoints after it succeeds
    pub auto_cleanup: bool,
    /// Processing steps assumed before the executor reports a total
    pub default_total_steps: usize,
}

impl Default for LongRunningConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: 30_000,
            progress_interval_ms: 5_000,
            max_retries: 3,
            retry_backoff: 2.0,
            auto_retry: true,
            task_timeout_ms: 0,
            max_checkpoints: 10,
            auto_cleanup: true,
            default_total_steps: 5,
        }
    }
}

impl LongRunningConfig {
    /// Check that the knobs make sense together
    pub fn validate(&self) -> WorkerResult<()> {
        if self.checkpoint_interval_ms == 0 {
            return Err(WorkerError::invalid_config(
                "checkpoint_interval_ms must be positive",
            ));
        }
        if self.progress_interval_ms == 0 {
            return Err(WorkerError::invalid_config(
                "progress_interval_ms must be positive",
            ));
        }
        if self.retry_backoff < 1.0 {
            return Err(WorkerError::invalid_config(
                "retry_backoff must be at least 1.0",
            ));
        }
        if self.max_checkpoints == 0 {
            return Err(WorkerError::invalid_config(
                "max_checkpoints must be at least 1",
            ));
        }
        if self.default_total_steps == 0 {
            return Err(WorkerError::invalid_config(
                "default_total_steps must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Mutable state of the run in flight, shared with the timer loops
#[derive(Debug)]
struct RunState {
    task: Option<Task>,
    phase: ExecutionPhase,
    step: usize,
    total_steps: usize,
    partial_results: Vec<Value>,
    context: HashMap<String, Value>,
    artifacts: Vec<TaskArtifact>,
    sequence: u64,
    cancel: CancelSignal,
    started_at: Option<Instant>,
    checkpoints_created: u64,
}

impl RunState {
    fn idle() -> Self {
        Self {
            task: None,
            phase: ExecutionPhase::Initialization,
            step: 0,
            total_steps: 1,
            partial_results: Vec::new(),
            context: HashMap::new(),
            artifacts: Vec::new(),
            sequence: 0,
            cancel: CancelSignal::new(),
            started_at: None,
            checkpoints_created: 0,
        }
    }
}

/// Progress sink wired into the shared run state
struct RunProgress(Arc<Mutex<RunState>>);

impl ProgressSink for RunProgress {
    fn set_phase(&self, phase: ExecutionPhase) {
        if let Ok(mut run) = self.0.lock() {
            run.phase = phase;
        }
    }

    fn begin_step(&self, step: usize, total_steps: usize) {
        if let Ok(mut run) = self.0.lock() {
            run.step = step;
            run.total_steps = total_steps.max(1);
        }
    }

    fn push_partial(&self, value: Value) {
        if let Ok(mut run) = self.0.lock() {
            run.partial_results.push(value);
        }
    }

    fn add_artifact(&self, artifact: TaskArtifact) {
        if let Ok(mut run) = self.0.lock() {
            run.artifacts.push(artifact);
        }
    }

    fn set_context(&self, key: String, value: Value) {
        if let Ok(mut run) = self.0.lock() {
            run.context.insert(key, value);
        }
    }
}

/// Execution seam for phased, resumable work
///
/// Failures must come back as errors so the retry ladder sees them; an
/// executor that hand-builds a failed [`TaskOutput`] opts out of retries.
#[async_trait]
pub trait StagedExecutor: Send + Sync {
    /// Run the task from a clean start
    async fn run(&self, task: &Task, ctx: &ExecutionContext) -> WorkerResult<TaskOutput>;

    /// Run the task from previously checkpointed state
    ///
    /// Extension point for executors that can skip completed steps. The
    /// default starts over with [`run`](StagedExecutor::run), which is
    /// always correct when steps are idempotent.
    async fn run_from_state(
        &self,
        task: &Task,
        state: &CheckpointState,
        ctx: &ExecutionContext,
    ) -> WorkerResult<TaskOutput> {
        let _ = state;
        self.run(task, ctx).await
    }
}

/// Shared reference to a staged executor
pub type SharedStagedExecutor = Arc<dyn StagedExecutor>;

/// Built-in staged executor that simulates a multi-step pipeline
///
/// Task input steers it: `total_steps` overrides the step count,
/// `fail_with` fails the run after processing, `fail_at_step` fails while a
/// specific step is in flight (before its partial result lands).
#[derive(Debug, Clone)]
pub struct DefaultStagedExecutor {
    /// Sleep per phase transition and per step
    pub step_delay_ms: u64,
    /// Step count when the task does not override it
    pub default_total_steps: usize,
}

impl Default for DefaultStagedExecutor {
    fn default() -> Self {
        Self {
            step_delay_ms: 50,
            default_total_steps: 5,
        }
    }
}

#[async_trait]
impl StagedExecutor for DefaultStagedExecutor {
    async fn run(&self, task: &Task, ctx: &ExecutionContext) -> WorkerResult<TaskOutput> {
        let delay = Duration::from_millis(self.step_delay_ms);

        ctx.set_phase(ExecutionPhase::Initialization);
        ctx.check_cancelled()?;
        tokio::time::sleep(delay).await;

        ctx.set_phase(ExecutionPhase::Processing);
        let total = task
            .input_u64("total_steps")
            .map(|n| n as usize)
            .filter(|n| *n > 0)
            .unwrap_or(self.default_total_steps);
        let fail_at = task.input_u64("fail_at_step");

        for step in 1..=total {
            ctx.check_cancelled()?;
            ctx.begin_step(step, total);
            tokio::time::sleep(delay).await;
            if fail_at == Some(step as u64) {
                return Err(WorkerError::execution(format!(
                    "step {step} of {total} failed"
                )));
            }
            ctx.push_partial(json!({"step": step, "completed": true}));
        }

        if let Some(reason) = task.input_str("fail_with") {
            return Err(WorkerError::execution(reason));
        }

        ctx.set_phase(ExecutionPhase::Finalization);
        ctx.check_cancelled()?;
        tokio::time::sleep(delay).await;

        let artifact = TaskArtifact::new(
            "run-summary",
            "summary",
            json!({"task_id": task.id, "steps": total}),
        );
        ctx.add_artifact(artifact.clone());

        Ok(TaskOutput::succeeded(
            &task.id,
            &ctx.worker_id,
            Some(json!({"steps_completed": total})),
        )
        .with_tokens_used(estimate_tokens(&task.description))
        .with_artifact(artifact))
    }
}

/// Adapter so the base worker's lifecycle hooks reach the staged executor
struct StagedAsTask {
    staged: SharedStagedExecutor,
}

#[async_trait]
impl TaskExecutor for StagedAsTask {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> WorkerResult<TaskOutput> {
        self.staged.run(task, ctx).await
    }
}

/// Background timer tasks attached to one run
struct TimerHandles {
    token: CancellationToken,
    tracker: TaskTracker,
}

/// Worker for multi-step tasks that outlive a single uninterrupted call
pub struct LongRunningWorker {
    base: WorkerBase,
    lr: LongRunningConfig,
    store: SharedCheckpointStore,
    staged: SharedStagedExecutor,
    run: Arc<Mutex<RunState>>,
    timers: Mutex<Option<TimerHandles>>,
}

impl LongRunningWorker {
    /// Create a long-running worker around a staged executor
    pub fn new(
        mut config: WorkerConfig,
        lr: LongRunningConfig,
        staged: SharedStagedExecutor,
        store: SharedCheckpointStore,
        events: SharedEventBus,
    ) -> WorkerResult<Self> {
        lr.validate()?;
        // One run slot and one timer pair: overlapping runs would share them.
        config.max_concurrent_tasks = 1;
        let base = WorkerBase::new(
            config,
            Arc::new(StagedAsTask {
                staged: staged.clone(),
            }),
            events,
        )?;
        Ok(Self {
            base,
            lr,
            store,
            staged,
            run: Arc::new(Mutex::new(RunState::idle())),
            timers: Mutex::new(None),
        })
    }

    /// Create a worker backed by the built-in staged executor
    pub fn with_default_executor(
        config: WorkerConfig,
        lr: LongRunningConfig,
        store: SharedCheckpointStore,
        events: SharedEventBus,
    ) -> WorkerResult<Self> {
        let staged = Arc::new(DefaultStagedExecutor {
            step_delay_ms: 50,
            default_total_steps: lr.default_total_steps,
        });
        Self::new(config, lr, staged, store, events)
    }

    fn lock_run(&self) -> WorkerResult<MutexGuard<'_, RunState>> {
        self.run.lock().map_err(|_| WorkerError::LockPoisoned)
    }

    /// Timing and resilience configuration
    pub fn long_running_config(&self) -> &LongRunningConfig {
        &self.lr
    }

    /// The checkpoint store backing this worker
    pub fn checkpoint_store(&self) -> &SharedCheckpointStore {
        &self.store
    }

    /// Checkpoints created during the current (or last) run
    pub fn checkpoints_created(&self) -> u64 {
        self.run.lock().map(|r| r.checkpoints_created).unwrap_or(0)
    }

    /// Phase of the current (or last) run
    pub fn current_phase(&self) -> ExecutionPhase {
        self.run
            .lock()
            .map(|r| r.phase)
            .unwrap_or(ExecutionPhase::Initialization)
    }

    /// Persist a snapshot of the current run
    ///
    /// Returns the new checkpoint's id, or `None` when no task is active.
    pub async fn save_checkpoint(&self) -> WorkerResult<Option<String>> {
        save_checkpoint_for(
            &self.run,
            &self.store,
            self.base.events(),
            self.base.id(),
            self.lr.max_checkpoints,
        )
        .await
    }

    /// Request cooperative cancellation of the running task
    ///
    /// Flips the polled flag, persists a final snapshot, and stops the
    /// timers. The executor unwinds at its next cancellation check; the
    /// in-flight `execute_task` call then settles with a failed output.
    /// Returns the snapshot's id, or `None` when nothing is running.
    pub async fn cancel_task(&self) -> WorkerResult<Option<String>> {
        {
            let run = self.lock_run()?;
            if run.task.is_none() {
                return Ok(None);
            }
            run.cancel.cancel();
        }
        info!(worker_id = %self.base.id(), "cancellation requested");

        let checkpoint_id = match self.save_checkpoint().await {
            Ok(id) => id,
            Err(err) => {
                warn!(worker_id = %self.base.id(), error = %err, "cancel snapshot failed");
                None
            }
        };
        self.stop_timers().await;
        Ok(checkpoint_id)
    }

    /// Resume a task from a stored checkpoint
    ///
    /// Rebuilds a task from the snapshot's identity metadata, restores the
    /// frozen state, and hands both to the executor's
    /// [`run_from_state`](StagedExecutor::run_from_state).
    pub async fn resume_from_checkpoint(&self, checkpoint_id: &str) -> WorkerResult<TaskOutput> {
        let checkpoint = self.store.load(checkpoint_id).await?;
        info!(
            worker_id = %self.base.id(),
            task_id = %checkpoint.task_id,
            checkpoint_id,
            sequence = checkpoint.sequence,
            "resuming from checkpoint"
        );

        let task = Task::new(
            checkpoint.task_id.clone(),
            checkpoint.metadata_str("task_type").unwrap_or("general"),
            checkpoint
                .metadata_str("task_description")
                .unwrap_or_default(),
        )
        .with_metadata("resumed_from", json!(checkpoint_id));

        self.base.begin_task(&task)?;
        let started = Instant::now();
        let outcome = self.run_pipeline(&task, Some(&checkpoint)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = self.base.finish_task(&task, outcome, elapsed_ms);
        self.stop_timers().await;
        result
    }

    async fn run_pipeline(
        &self,
        task: &Task,
        restore: Option<&Checkpoint>,
    ) -> WorkerResult<TaskOutput> {
        let cancel = CancelSignal::new();
        {
            let mut run = self.lock_run()?;
            run.task = Some(task.clone());
            run.cancel = cancel.clone();
            run.started_at = Some(Instant::now());
            run.checkpoints_created = 0;
            match restore {
                Some(cp) => {
                    run.phase = cp.state.phase;
                    run.step = cp.state.step;
                    run.total_steps = cp.state.total_steps.max(1);
                    run.partial_results = cp.state.partial_results.clone();
                    run.context = cp.state.context.clone();
                    run.artifacts = cp.state.artifacts.clone();
                    // Sequences only ever move forward per (task, worker).
                    run.sequence = run.sequence.max(cp.sequence);
                }
                None => {
                    run.phase = ExecutionPhase::Initialization;
                    run.step = 0;
                    run.total_steps = self.lr.default_total_steps;
                    run.partial_results.clear();
                    run.context.clear();
                    run.artifacts.clear();
                }
            }
        }

        self.start_timers()?;

        let progress: Arc<dyn ProgressSink> = Arc::new(RunProgress(self.run.clone()));
        let ctx = ExecutionContext::new(self.base.id(), &task.id, cancel).with_progress(progress);

        let timeout_ms = task.timeout_ms.unwrap_or(self.lr.task_timeout_ms);
        let max_attempts = if self.lr.auto_retry {
            self.lr.max_retries.max(1)
        } else {
            1
        };

        let mut attempts_made = 0u32;
        let final_err: WorkerError;
        loop {
            let attempt = attempts_made + 1;
            let execution = async {
                match restore {
                    Some(cp) if attempt == 1 => {
                        self.staged.run_from_state(task, &cp.state, &ctx).await
                    }
                    _ => self.staged.run(task, &ctx).await,
                }
            };

            let outcome = if timeout_ms > 0 {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), execution).await {
                    Ok(result) => result,
                    Err(_) => Err(WorkerError::Timeout {
                        task_id: task.id.clone(),
                        timeout_ms,
                    }),
                }
            } else {
                execution.await
            };
            attempts_made = attempt;

            match outcome {
                Ok(output) => {
                    return self.finish_success(task, output, attempts_made).await;
                }
                Err(err) => {
                    warn!(
                        worker_id = %self.base.id(),
                        task_id = %task.id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "execution attempt failed"
                    );
                    if attempt >= max_attempts || !err.is_retryable() {
                        final_err = err;
                        break;
                    }

                    let delay_ms = (RETRY_BASE_DELAY_MS as f64
                        * self.lr.retry_backoff.powi(attempt as i32 - 1))
                        as u64;
                    debug!(
                        worker_id = %self.base.id(),
                        task_id = %task.id,
                        delay_ms,
                        "backing off before retry"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                    let mut run = self.lock_run()?;
                    run.phase = ExecutionPhase::Initialization;
                    run.step = 0;
                    run.partial_results.clear();
                    run.artifacts.clear();
                }
            }
        }

        self.finish_failure(task, final_err, attempts_made).await
    }

    /// Success epilogue: optional checkpoint cleanup plus run metadata
    async fn finish_success(
        &self,
        task: &Task,
        output: TaskOutput,
        attempts: u32,
    ) -> WorkerResult<TaskOutput> {
        // The timer loops must be fully drained before the sweep; a tick
        // landing mid-sweep would persist a checkpoint the sweep never sees.
        self.stop_timers().await;
        if let Ok(mut run) = self.run.lock() {
            run.task = None;
        }
        let checkpoints_created = self.checkpoints_created();
        if self.lr.auto_cleanup {
            match self.store.delete_all(&task.id).await {
                Ok(deleted) if deleted > 0 => {
                    debug!(task_id = %task.id, deleted, "cleaned up checkpoints")
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "checkpoint cleanup failed")
                }
            }
        }
        Ok(output
            .with_metadata("attempts", json!(attempts))
            .with_metadata("checkpoints_created", json!(checkpoints_created)))
    }

    /// Failure epilogue: final snapshot, then a failed output that names it
    async fn finish_failure(
        &self,
        task: &Task,
        err: WorkerError,
        attempts: u32,
    ) -> WorkerResult<TaskOutput> {
        let checkpoint_id = match self.save_checkpoint().await {
            Ok(id) => id,
            Err(save_err) => {
                warn!(
                    worker_id = %self.base.id(),
                    task_id = %task.id,
                    error = %save_err,
                    "final checkpoint save failed"
                );
                self.base.events().publish(SwarmEvent::CheckpointError {
                    worker_id: self.base.id().to_string(),
                    task_id: task.id.clone(),
                    error: save_err.to_string(),
                    timestamp: Utc::now(),
                });
                None
            }
        };

        if let Ok(mut run) = self.run.lock() {
            run.task = None;
        }

        let mut output = TaskOutput::failed(&task.id, self.base.id(), err.to_string())
            .with_metadata("attempts", json!(attempts));
        if let Some(id) = checkpoint_id {
            output = output.with_metadata("checkpoint_id", json!(id));
        }
        Ok(output)
    }

    /// Start the checkpoint and progress timer loops for a new run
    fn start_timers(&self) -> WorkerResult<()> {
        let mut slot = self.timers.lock().map_err(|_| WorkerError::LockPoisoned)?;
        if let Some(stale) = slot.take() {
            stale.token.cancel();
        }

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        {
            let token = token.clone();
            let run = self.run.clone();
            let store = self.store.clone();
            let events = self.base.events().clone();
            let worker_id = self.base.id().to_string();
            let max_checkpoints = self.lr.max_checkpoints;
            let interval = Duration::from_millis(self.lr.checkpoint_interval_ms);
            tracker.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let result = save_checkpoint_for(
                                &run, &store, &events, &worker_id, max_checkpoints,
                            )
                            .await;
                            if let Err(err) = result {
                                // The run keeps going; surface through the bus.
                                let task_id = current_task_id(&run).unwrap_or_default();
                                warn!(
                                    worker_id = %worker_id,
                                    task_id = %task_id,
                                    error = %err,
                                    "periodic checkpoint failed"
                                );
                                events.publish(SwarmEvent::CheckpointError {
                                    worker_id: worker_id.clone(),
                                    task_id,
                                    error: err.to_string(),
                                    timestamp: Utc::now(),
                                });
                            }
                        }
                    }
                }
            });
        }

        {
            let token = token.clone();
            let run = self.run.clone();
            let events = self.base.events().clone();
            let worker_id = self.base.id().to_string();
            let interval = Duration::from_millis(self.lr.progress_interval_ms);
            tracker.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Some(event) = progress_event(&run, &worker_id) {
                                events.publish(event);
                            }
                        }
                    }
                }
            });
        }

        tracker.close();
        *slot = Some(TimerHandles { token, tracker });
        Ok(())
    }

    /// Stop the timer loops and wait for them to drain
    async fn stop_timers(&self) {
        let handles = match self.timers.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(TimerHandles { token, tracker }) = handles {
            token.cancel();
            tracker.wait().await;
        }
    }
}

/// Progress estimate for a phase/step position
fn progress_estimate(phase: ExecutionPhase, step: usize, total_steps: usize) -> f64 {
    match phase {
        ExecutionPhase::Initialization => 0.05,
        ExecutionPhase::Processing => 0.1 + 0.8 * (step as f64 / total_steps.max(1) as f64),
        ExecutionPhase::Finalization => 0.95,
    }
}

fn current_task_id(run: &Arc<Mutex<RunState>>) -> Option<String> {
    run.lock()
        .ok()
        .and_then(|r| r.task.as_ref().map(|t| t.id.clone()))
}

/// Build a progress event from the live run state, if a task is active
fn progress_event(run: &Arc<Mutex<RunState>>, worker_id: &str) -> Option<SwarmEvent> {
    let run = run.lock().ok()?;
    let task = run.task.as_ref()?;
    let progress = progress_estimate(run.phase, run.step, run.total_steps);
    let eta_ms = run.started_at.and_then(|started| {
        if progress <= 0.0 {
            return None;
        }
        let elapsed = started.elapsed().as_millis() as f64;
        Some((elapsed / progress * (1.0 - progress)) as u64)
    });
    Some(SwarmEvent::Progress {
        worker_id: worker_id.to_string(),
        task_id: task.id.clone(),
        progress,
        eta_ms,
        timestamp: Utc::now(),
    })
}

/// Snapshot the run state into a checkpoint and persist it
///
/// Shared by the worker methods and the checkpoint timer loop. The run lock
/// is released before the store call; the sequence is claimed under the
/// lock, so concurrent savers never collide.
async fn save_checkpoint_for(
    run: &Arc<Mutex<RunState>>,
    store: &SharedCheckpointStore,
    events: &SharedEventBus,
    worker_id: &str,
    max_checkpoints: usize,
) -> WorkerResult<Option<String>> {
    let checkpoint = {
        let mut run = run.lock().map_err(|_| WorkerError::LockPoisoned)?;
        let task = match &run.task {
            Some(task) => task.clone(),
            None => return Ok(None),
        };
        run.sequence += 1;
        let state = CheckpointState {
            phase: run.phase,
            step: run.step,
            total_steps: run.total_steps,
            partial_results: run.partial_results.clone(),
            context: run.context.clone(),
            artifacts: run.artifacts.clone(),
        };
        let progress = progress_estimate(run.phase, run.step, run.total_steps);
        Checkpoint::new(&task.id, worker_id, run.sequence, state, progress)
            .with_metadata("task_type", json!(task.task_type))
            .with_metadata("task_description", json!(task.description))
    };

    store.save(&checkpoint).await?;
    if let Ok(mut run) = run.lock() {
        run.checkpoints_created += 1;
    }

    debug!(
        worker_id,
        task_id = %checkpoint.task_id,
        checkpoint_id = %checkpoint.id,
        sequence = checkpoint.sequence,
        "checkpoint saved"
    );
    events.publish(SwarmEvent::CheckpointSaved {
        worker_id: worker_id.to_string(),
        task_id: checkpoint.task_id.clone(),
        checkpoint_id: checkpoint.id.clone(),
        sequence: checkpoint.sequence,
        timestamp: Utc::now(),
    });

    trim_checkpoints(store, &checkpoint.task_id, worker_id, max_checkpoints).await;
    Ok(Some(checkpoint.id))
}

/// Delete oldest checkpoints beyond the retention limit
async fn trim_checkpoints(
    store: &SharedCheckpointStore,
    task_id: &str,
    worker_id: &str,
    max_checkpoints: usize,
) {
    let listed = match store.list(task_id, worker_id).await {
        Ok(listed) => listed,
        Err(err) => {
            warn!(task_id, error = %err, "checkpoint trim listing failed");
            return;
        }
    };
    if listed.len() <= max_checkpoints {
        return;
    }
    let excess = listed.len() - max_checkpoints;
    for stale in listed.into_iter().take(excess) {
        if let Err(err) = store.delete(&stale.id).await {
            warn!(
                task_id,
                checkpoint_id = %stale.id,
                error = %err,
                "checkpoint trim delete failed"
            );
        }
    }
}

#[async_trait]
impl Worker for LongRunningWorker {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn worker_type(&self) -> &str {
        self.base.worker_type()
    }

    fn config(&self) -> &WorkerConfig {
        self.base.config()
    }

    fn status(&self) -> WorkerStatus {
        self.base.status()
    }

    fn load(&self) -> f64 {
        self.base.load()
    }

    fn active_tasks(&self) -> usize {
        self.base.active_tasks()
    }

    fn metrics(&self) -> WorkerMetrics {
        self.base.metrics()
    }

    fn health(&self) -> WorkerHealth {
        self.base.health()
    }

    fn similarity(&self, embedding: &[f32]) -> f32 {
        self.base.similarity(embedding)
    }

    async fn initialize(&self) -> WorkerResult<()> {
        self.base.initialize().await
    }

    async fn execute_task(&self, task: Task) -> WorkerResult<TaskOutput> {
        self.base.begin_task(&task)?;
        let started = Instant::now();
        let outcome = self.run_pipeline(&task, None).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = self.base.finish_task(&task, outcome, elapsed_ms);
        self.stop_timers().await;
        result
    }

    async fn shutdown(&self) -> WorkerResult<()> {
        self.stop_timers().await;
        self.base.shutdown().await
    }

    fn push_message(&self, message: WorkerMessage) {
        self.base.push_message(message)
    }

    fn drain_messages(&self) -> Vec<WorkerMessage> {
        self.base.drain_messages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::worker::checkpoint::{
        CheckpointError, CheckpointResult, CheckpointStore, MemoryCheckpointStore,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> LongRunningConfig {
        LongRunningConfig {
            checkpoint_interval_ms: 10_000,
            progress_interval_ms: 5_000,
            max_retries: 3,
            retry_backoff: 2.0,
            auto_retry: true,
            task_timeout_ms: 0,
            max_checkpoints: 10,
            auto_cleanup: true,
            default_total_steps: 3,
        }
    }

    fn worker_with(
        lr: LongRunningConfig,
        store: SharedCheckpointStore,
    ) -> Arc<LongRunningWorker> {
        Arc::new(
            LongRunningWorker::with_default_executor(
                WorkerConfig::new("lr-1", "data-analysis").with_capability("data-analysis"),
                lr,
                store,
                EventBus::new().shared(),
            )
            .unwrap(),
        )
    }

    /// Staged executor that fails a fixed number of runs before succeeding
    struct FlakyStagedExecutor {
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl StagedExecutor for FlakyStagedExecutor {
        async fn run(&self, task: &Task, ctx: &ExecutionContext) -> WorkerResult<TaskOutput> {
            ctx.set_phase(ExecutionPhase::Processing);
            ctx.begin_step(1, 1);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(WorkerError::execution("transient backend error"));
            }
            Ok(TaskOutput::succeeded(&task.id, &ctx.worker_id, None))
        }
    }

    /// Store whose saves always fail
    struct FailingStore;

    #[async_trait]
    impl CheckpointStore for FailingStore {
        async fn save(&self, _checkpoint: &Checkpoint) -> CheckpointResult<()> {
            Err(CheckpointError::storage("disk full"))
        }

        async fn load(&self, id: &str) -> CheckpointResult<Checkpoint> {
            Err(CheckpointError::NotFound { id: id.to_string() })
        }

        async fn load_latest(
            &self,
            _task_id: &str,
            _worker_id: &str,
        ) -> CheckpointResult<Option<Checkpoint>> {
            Ok(None)
        }

        async fn list(&self, _task_id: &str, _worker_id: &str) -> CheckpointResult<Vec<Checkpoint>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _id: &str) -> CheckpointResult<()> {
            Ok(())
        }

        async fn delete_all(&self, _task_id: &str) -> CheckpointResult<usize> {
            Ok(0)
        }
    }

    /// Store whose cleanup sweep acknowledges slowly
    struct SlowCleanupStore {
        inner: MemoryCheckpointStore,
    }

    #[async_trait]
    impl CheckpointStore for SlowCleanupStore {
        async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
            self.inner.save(checkpoint).await
        }

        async fn load(&self, id: &str) -> CheckpointResult<Checkpoint> {
            self.inner.load(id).await
        }

        async fn load_latest(
            &self,
            task_id: &str,
            worker_id: &str,
        ) -> CheckpointResult<Option<Checkpoint>> {
            self.inner.load_latest(task_id, worker_id).await
        }

        async fn list(&self, task_id: &str, worker_id: &str) -> CheckpointResult<Vec<Checkpoint>> {
            self.inner.list(task_id, worker_id).await
        }

        async fn delete(&self, id: &str) -> CheckpointResult<()> {
            self.inner.delete(id).await
        }

        async fn delete_all(&self, task_id: &str) -> CheckpointResult<usize> {
            let deleted = self.inner.delete_all(task_id).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(deleted)
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(fast_config().validate().is_ok());

        let mut bad = fast_config();
        bad.checkpoint_interval_ms = 0;
        assert!(bad.validate().is_err());

        let mut bad = fast_config();
        bad.retry_backoff = 0.5;
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_run_slot_caps_concurrency() {
        let store: SharedCheckpointStore = Arc::new(MemoryCheckpointStore::new());
        let worker = Arc::new(
            LongRunningWorker::with_default_executor(
                WorkerConfig::new("lr-1", "data-analysis")
                    .with_capability("data-analysis")
                    .with_max_concurrent_tasks(3),
                fast_config(),
                store,
                EventBus::new().shared(),
            )
            .unwrap(),
        );
        assert_eq!(worker.config().max_concurrent_tasks, 1);
        worker.initialize().await.unwrap();

        let runner = worker.clone();
        let handle = tokio::spawn(async move {
            runner
                .execute_task(Task::new("t-first", "data-analysis", "long crunch"))
                .await
        });
        while worker.active_tasks() == 0 {
            tokio::task::yield_now().await;
        }

        let err = worker
            .execute_task(Task::new("t-second", "data-analysis", "rejected"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::AtCapacity { .. }));

        let output = handle.await.unwrap().unwrap();
        assert!(output.success);
        assert_eq!(worker.status(), WorkerStatus::Idle);
    }

    #[test]
    fn test_progress_estimate_shape() {
        assert!((progress_estimate(ExecutionPhase::Initialization, 0, 5) - 0.05).abs() < 1e-9);
        assert!((progress_estimate(ExecutionPhase::Processing, 0, 5) - 0.1).abs() < 1e-9);
        assert!((progress_estimate(ExecutionPhase::Processing, 5, 5) - 0.9).abs() < 1e-9);
        assert!((progress_estimate(ExecutionPhase::Finalization, 5, 5) - 0.95).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_through_phases() {
        let store: SharedCheckpointStore = Arc::new(MemoryCheckpointStore::new());
        let worker = worker_with(fast_config(), store);
        worker.initialize().await.unwrap();

        let output = worker
            .execute_task(Task::new("t-1", "data-analysis", "crunch the numbers"))
            .await
            .unwrap();

        assert!(output.success);
        assert_eq!(output.metadata.get("attempts"), Some(&json!(1)));
        assert_eq!(output.artifacts.len(), 1);
        assert_eq!(worker.status(), WorkerStatus::Idle);
        assert_eq!(worker.metrics().tasks_succeeded, 1);
        assert_eq!(worker.current_phase(), ExecutionPhase::Finalization);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_leaves_resumable_checkpoint() {
        let store: SharedCheckpointStore = Arc::new(MemoryCheckpointStore::new());
        let mut lr = fast_config();
        lr.auto_retry = false;
        let worker = worker_with(lr, store.clone());
        worker.initialize().await.unwrap();

        let task = Task::new("t-fail", "data-analysis", "crunch the numbers")
            .with_input(json!({"total_steps": 5, "fail_at_step": 3}));
        let output = worker.execute_task(task).await.unwrap();

        assert!(!output.success);
        assert_eq!(output.metadata.get("attempts"), Some(&json!(1)));
        let checkpoint_id = output.metadata_str("checkpoint_id").unwrap().to_string();

        let checkpoint = store.load(&checkpoint_id).await.unwrap();
        assert_eq!(checkpoint.task_id, "t-fail");
        assert_eq!(checkpoint.worker_id, "lr-1");
        assert_eq!(checkpoint.state.step, 3);
        assert_eq!(checkpoint.state.partial_results.len(), 2);
        assert_eq!(checkpoint.metadata_str("task_type"), Some("data-analysis"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ladder_recovers_after_transient_failures() {
        let store: SharedCheckpointStore = Arc::new(MemoryCheckpointStore::new());
        let worker = Arc::new(
            LongRunningWorker::new(
                WorkerConfig::new("lr-1", "data-analysis"),
                fast_config(),
                Arc::new(FlakyStagedExecutor {
                    failures_remaining: AtomicU32::new(2),
                }),
                store.clone(),
                EventBus::new().shared(),
            )
            .unwrap(),
        );
        worker.initialize().await.unwrap();

        let output = worker
            .execute_task(Task::new("t-flaky", "data-analysis", "eventually fine"))
            .await
            .unwrap();

        assert!(output.success);
        // Two failures, one success: three attempts total.
        assert_eq!(output.metadata.get("attempts"), Some(&json!(3)));
        assert_eq!(worker.metrics().tasks_succeeded, 1);
        // Success with auto-cleanup leaves no checkpoints behind.
        assert!(store.list("t-flaky", "lr-1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_reports_failure() {
        let store: SharedCheckpointStore = Arc::new(MemoryCheckpointStore::new());
        let worker = Arc::new(
            LongRunningWorker::new(
                WorkerConfig::new("lr-1", "data-analysis"),
                fast_config(),
                Arc::new(FlakyStagedExecutor {
                    failures_remaining: AtomicU32::new(10),
                }),
                store,
                EventBus::new().shared(),
            )
            .unwrap(),
        );
        worker.initialize().await.unwrap();

        let output = worker
            .execute_task(Task::new("t-flaky", "data-analysis", "never fine"))
            .await
            .unwrap();

        assert!(!output.success);
        assert_eq!(output.metadata.get("attempts"), Some(&json!(3)));
        assert_eq!(worker.metrics().tasks_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checkpoints_respect_retention() {
        let store: SharedCheckpointStore = Arc::new(MemoryCheckpointStore::new());
        let mut lr = fast_config();
        lr.checkpoint_interval_ms = 10;
        lr.progress_interval_ms = 10;
        lr.max_checkpoints = 3;
        lr.auto_cleanup = false;
        let worker = Arc::new(
            LongRunningWorker::new(
                WorkerConfig::new("lr-1", "data-analysis"),
                lr,
                Arc::new(DefaultStagedExecutor {
                    step_delay_ms: 20,
                    default_total_steps: 10,
                }),
                store.clone(),
                EventBus::new().shared(),
            )
            .unwrap(),
        );
        worker.initialize().await.unwrap();

        let mut rx = worker.base.events().subscribe();
        let output = worker
            .execute_task(Task::new("t-long", "data-analysis", "slow crunch"))
            .await
            .unwrap();
        assert!(output.success);
        assert!(worker.checkpoints_created() > 3);

        let listed = store.list("t-long", "lr-1").await.unwrap();
        assert!(!listed.is_empty());
        assert!(listed.len() <= 3);
        let sequences: Vec<u64> = listed.iter().map(|cp| cp.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sequences, sorted, "sequences strictly increasing");

        let mut saw_checkpoint_event = false;
        let mut saw_progress_event = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SwarmEvent::CheckpointSaved { .. } => saw_checkpoint_event = true,
                SwarmEvent::Progress { progress, .. } => {
                    saw_progress_event = true;
                    assert!((0.0..=1.0).contains(&progress));
                }
                _ => {}
            }
        }
        assert!(saw_checkpoint_event);
        assert!(saw_progress_event);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_outlasts_checkpoint_timer() {
        let store: SharedCheckpointStore = Arc::new(SlowCleanupStore {
            inner: MemoryCheckpointStore::new(),
        });
        let mut lr = fast_config();
        lr.checkpoint_interval_ms = 100;
        let worker = worker_with(lr, store.clone());
        worker.initialize().await.unwrap();

        let output = worker
            .execute_task(Task::new("t-sweep", "data-analysis", "crunch on slow storage"))
            .await
            .unwrap();

        assert!(output.success);
        assert!(worker.checkpoints_created() >= 2);
        assert!(store.list("t-sweep", "lr-1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_takes_snapshot_and_unwinds() {
        let store: SharedCheckpointStore = Arc::new(MemoryCheckpointStore::new());
        let mut lr = fast_config();
        lr.auto_retry = false;
        let worker = Arc::new(
            LongRunningWorker::new(
                WorkerConfig::new("lr-1", "data-analysis"),
                lr,
                Arc::new(DefaultStagedExecutor {
                    step_delay_ms: 50,
                    default_total_steps: 20,
                }),
                store.clone(),
                EventBus::new().shared(),
            )
            .unwrap(),
        );
        worker.initialize().await.unwrap();

        let runner = worker.clone();
        let handle = tokio::spawn(async move {
            runner
                .execute_task(Task::new("t-cancel", "data-analysis", "endless crunch"))
                .await
        });
        while worker.active_tasks() == 0 {
            tokio::task::yield_now().await;
        }

        let snapshot_id = worker.cancel_task().await.unwrap();
        assert!(snapshot_id.is_some());

        let output = handle.await.unwrap().unwrap();
        assert!(!output.success);
        assert!(output
            .error
            .as_deref()
            .map(|e| e.contains("cancelled"))
            .unwrap_or(false));
        assert_eq!(worker.status(), WorkerStatus::Idle);

        let snapshot = store.load(&snapshot_id.unwrap()).await.unwrap();
        assert_eq!(snapshot.task_id, "t-cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_without_active_task_is_noop() {
        let store: SharedCheckpointStore = Arc::new(MemoryCheckpointStore::new());
        let worker = worker_with(fast_config(), store);
        worker.initialize().await.unwrap();
        assert_eq!(worker.cancel_task().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_from_checkpoint_completes() {
        let store: SharedCheckpointStore = Arc::new(MemoryCheckpointStore::new());
        let mut lr = fast_config();
        lr.auto_retry = false;
        let worker = worker_with(lr, store.clone());
        worker.initialize().await.unwrap();

        let task = Task::new("t-resume", "data-analysis", "crunch with a crash")
            .with_input(json!({"total_steps": 4, "fail_at_step": 2}));
        let failed = worker.execute_task(task).await.unwrap();
        assert!(!failed.success);
        let checkpoint_id = failed.metadata_str("checkpoint_id").unwrap().to_string();

        let resumed = worker.resume_from_checkpoint(&checkpoint_id).await.unwrap();
        assert!(resumed.success);
        assert_eq!(resumed.task_id, "t-resume");
        assert_eq!(worker.metrics().tasks_succeeded, 1);
        assert_eq!(worker.metrics().tasks_failed, 1);
        // Success with auto-cleanup wipes the task's checkpoints.
        assert!(store.list("t-resume", "lr-1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_races_execution() {
        let store: SharedCheckpointStore = Arc::new(MemoryCheckpointStore::new());
        let mut lr = fast_config();
        lr.auto_retry = false;
        let worker = Arc::new(
            LongRunningWorker::new(
                WorkerConfig::new("lr-1", "data-analysis"),
                lr,
                Arc::new(DefaultStagedExecutor {
                    step_delay_ms: 500,
                    default_total_steps: 10,
                }),
                store,
                EventBus::new().shared(),
            )
            .unwrap(),
        );
        worker.initialize().await.unwrap();

        let task = Task::new("t-slow", "data-analysis", "too slow").with_timeout_ms(200);
        let output = worker.execute_task(task).await.unwrap();

        assert!(!output.success);
        assert!(output
            .error
            .as_deref()
            .map(|e| e.contains("timed out"))
            .unwrap_or(false));
        assert!(output.metadata_str("checkpoint_id").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_save_failure_reports_event_and_run_survives() {
        let mut lr = fast_config();
        lr.checkpoint_interval_ms = 10;
        lr.auto_retry = false;
        let worker = Arc::new(
            LongRunningWorker::new(
                WorkerConfig::new("lr-1", "data-analysis"),
                lr,
                Arc::new(DefaultStagedExecutor {
                    step_delay_ms: 20,
                    default_total_steps: 5,
                }),
                Arc::new(FailingStore),
                EventBus::new().shared(),
            )
            .unwrap(),
        );
        worker.initialize().await.unwrap();

        let mut rx = worker.base.events().subscribe();
        let output = worker
            .execute_task(Task::new("t-1", "data-analysis", "storage is down"))
            .await
            .unwrap();

        // Save failures never sink the task itself.
        assert!(output.success);
        let mut saw_checkpoint_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SwarmEvent::CheckpointError { .. }) {
                saw_checkpoint_error = true;
            }
        }
        assert!(saw_checkpoint_error);
    }
}
