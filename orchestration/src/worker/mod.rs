//! Worker hierarchy: trait seams and shared types
//!
//! A [`Worker`] is a stateful unit that accepts one task at a time up to its
//! concurrency ceiling and reports a structured [`TaskOutput`]. Three
//! implementations live in this module tree:
//!
//! - [`base::WorkerBase`] — lifecycle, admission, load/metrics accounting
//! - [`specialized::SpecializedWorker`] — domain tagging and task-match scoring
//! - [`long_running::LongRunningWorker`] — checkpointing, retry, timeout,
//!   cooperative cancellation
//!
//! Execution itself sits behind the [`TaskExecutor`] seam so hosts inject
//! their own logic; the built-in [`SimulatedExecutor`] keeps the subsystem
//! fully functional with no external services wired up.

pub mod base;
pub mod checkpoint;
pub mod long_running;
pub mod specialized;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::{estimate_tokens, Task, TaskArtifact, TaskOutput};
use checkpoint::CheckpointError;

/// Default concurrency ceiling for a worker
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 3;

/// Health score below which a worker is unhealthy
pub const UNHEALTHY_BELOW: f64 = 0.5;

/// Health score below which a worker is degraded
pub const DEGRADED_BELOW: f64 = 0.8;

/// Load factor above which a "High load" issue is always reported
pub const HIGH_LOAD_ABOVE: f64 = 0.9;

/// Error type for worker operations
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker {worker_id} at capacity ({active}/{max_concurrent})")]
    AtCapacity {
        worker_id: String,
        active: usize,
        max_concurrent: usize,
    },

    #[error("invalid task: {reason}")]
    InvalidTask { reason: String },

    #[error("invalid worker config: {reason}")]
    InvalidConfig { reason: String },

    #[error("worker {worker_id} failed to initialize: {reason}")]
    InitializationFailed { worker_id: String, reason: String },

    #[error("worker {worker_id} is {status} and cannot accept tasks")]
    NotAvailable {
        worker_id: String,
        status: WorkerStatus,
    },

    #[error("task {task_id} cancelled")]
    Cancelled { task_id: String },

    #[error("task {task_id} timed out after {timeout_ms}ms")]
    Timeout { task_id: String, timeout_ms: u64 },

    #[error("task execution failed: {reason}")]
    Execution { reason: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("worker state lock poisoned")]
    LockPoisoned,
}

impl WorkerError {
    /// Create an invalid-task error
    pub fn invalid_task(reason: impl Into<String>) -> Self {
        WorkerError::InvalidTask {
            reason: reason.into(),
        }
    }

    /// Create an invalid-config error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        WorkerError::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an initialization error
    pub fn initialization(worker_id: impl Into<String>, reason: impl Into<String>) -> Self {
        WorkerError::InitializationFailed {
            worker_id: worker_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an execution error
    pub fn execution(reason: impl Into<String>) -> Self {
        WorkerError::Execution {
            reason: reason.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(task_id: impl Into<String>) -> Self {
        WorkerError::Cancelled {
            task_id: task_id.into(),
        }
    }

    /// Whether a retry loop should attempt this error again
    ///
    /// Cancellation, capacity, and configuration errors are final; execution
    /// failures, timeouts, and checkpoint storage hiccups are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::Execution { .. }
                | WorkerError::Timeout { .. }
                | WorkerError::Checkpoint(_)
        )
    }
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Lifecycle status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Constructed but not yet initialized
    Spawning,
    /// Initialized, no tasks in flight
    Idle,
    /// At least one task in flight
    Busy,
    /// Initialization failed; the worker needs recovery
    Error,
    /// Shut down; no further tasks accepted
    Terminated,
}

impl WorkerStatus {
    /// Whether tasks may be admitted in this status
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Spawning => write!(f, "spawning"),
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Error => write!(f, "error"),
            WorkerStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Static configuration for a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique worker identifier (required, must be non-empty)
    pub id: String,

    /// Worker type tag, aligned with task type tags for routing
    pub worker_type: String,

    /// Human-readable name
    pub name: String,

    /// Declared capabilities
    pub capabilities: Vec<String>,

    /// Explicit specialization embedding; derived from capabilities when unset
    pub specialization: Option<Vec<f32>>,

    /// Concurrency ceiling for task execution
    pub max_concurrent_tasks: usize,

    /// Arbitrary construction metadata
    pub metadata: HashMap<String, Value>,
}

impl WorkerConfig {
    /// Create a config with defaults for the given identity and type
    pub fn new(id: impl Into<String>, worker_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            worker_type: worker_type.into(),
            capabilities: Vec::new(),
            specialization: None,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            metadata: HashMap::new(),
        }
    }

    /// Set the human-readable name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add one capability
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Replace the capability set
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set an explicit specialization embedding
    pub fn with_specialization(mut self, embedding: Vec<f32>) -> Self {
        self.specialization = Some(embedding);
        self
    }

    /// Set the concurrency ceiling
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check required fields
    pub fn validate(&self) -> WorkerResult<()> {
        if self.id.trim().is_empty() {
            return Err(WorkerError::invalid_config("worker id is empty"));
        }
        if self.worker_type.trim().is_empty() {
            return Err(WorkerError::invalid_config("worker type is empty"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(WorkerError::invalid_config(
                "max_concurrent_tasks must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Running execution counters owned by a worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Total tasks executed (successes and failures)
    pub tasks_executed: u64,
    /// Tasks that completed successfully
    pub tasks_succeeded: u64,
    /// Tasks that failed
    pub tasks_failed: u64,
    /// Running average execution duration in milliseconds
    pub avg_duration_ms: f64,
    /// Total tokens consumed across executions
    pub total_tokens_used: u64,
}

impl WorkerMetrics {
    /// Success fraction; a worker with no history counts as fully successful
    pub fn success_rate(&self) -> f64 {
        if self.tasks_executed == 0 {
            1.0
        } else {
            self.tasks_succeeded as f64 / self.tasks_executed as f64
        }
    }

    /// Fold one finished execution into the counters
    pub fn record(&mut self, duration_ms: u64, tokens_used: u64, success: bool) {
        self.tasks_executed += 1;
        if success {
            self.tasks_succeeded += 1;
        } else {
            self.tasks_failed += 1;
        }
        let n = self.tasks_executed as f64;
        self.avg_duration_ms = (self.avg_duration_ms * (n - 1.0) + duration_ms as f64) / n;
        self.total_tokens_used += tokens_used;
    }
}

/// Coarse health classification derived from the composite score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Snapshot of a worker's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Coarse classification
    pub status: HealthStatus,
    /// Composite score: 0.7 × success rate + 0.3 × (1 − load)
    pub score: f64,
    /// Load factor at evaluation time
    pub load: f64,
    /// Human-readable findings
    pub issues: Vec<String>,
}

impl WorkerHealth {
    /// Evaluate health from current metrics and load
    pub fn evaluate(metrics: &WorkerMetrics, load: f64) -> Self {
        let success_rate = metrics.success_rate();
        let score = 0.7 * success_rate + 0.3 * (1.0 - load);

        let status = if score < UNHEALTHY_BELOW {
            HealthStatus::Unhealthy
        } else if score < DEGRADED_BELOW {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let mut issues = Vec::new();
        if load > HIGH_LOAD_ABOVE {
            issues.push(format!("High load ({:.0}%)", load * 100.0));
        }
        if metrics.tasks_executed > 0 && success_rate < UNHEALTHY_BELOW {
            issues.push(format!("Low success rate ({:.0}%)", success_rate * 100.0));
        }

        Self {
            status,
            score,
            load,
            issues,
        }
    }
}

/// Message exchanged between workers over a worker-owned queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMessage {
    /// Sending worker id
    pub from: String,
    /// Receiving worker id
    pub to: String,
    /// Message topic tag
    pub topic: String,
    /// Message payload
    pub payload: Value,
    /// Send timestamp
    pub sent_at: DateTime<Utc>,
}

impl WorkerMessage {
    /// Create a new message
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        topic: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            topic: topic.into(),
            payload,
            sent_at: Utc::now(),
        }
    }
}

/// Cooperative cancellation flag polled between logical execution steps
///
/// Cancelling never forcibly interrupts in-progress work; executors observe
/// the flag at their own suspension points.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    /// Create a fresh, uncancelled signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Phase of a long-running execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// Setting up work state
    Initialization,
    /// Walking the processing steps
    Processing,
    /// Producing final results
    Finalization,
}

impl Default for ExecutionPhase {
    fn default() -> Self {
        ExecutionPhase::Initialization
    }
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionPhase::Initialization => write!(f, "initialization"),
            ExecutionPhase::Processing => write!(f, "processing"),
            ExecutionPhase::Finalization => write!(f, "finalization"),
        }
    }
}

/// Sink for progress reported by an executor mid-flight
///
/// Long-running workers wire this to their checkpointable run state; plain
/// workers leave it unset and the context methods become no-ops.
pub trait ProgressSink: Send + Sync {
    /// Enter an execution phase
    fn set_phase(&self, phase: ExecutionPhase);
    /// Begin a processing step (1-based) out of a total
    fn begin_step(&self, step: usize, total_steps: usize);
    /// Record a partial result
    fn push_partial(&self, value: Value);
    /// Record an artifact
    fn add_artifact(&self, artifact: TaskArtifact);
    /// Store a context entry carried across checkpoints
    fn set_context(&self, key: String, value: Value);
}

/// Per-execution context handed to a [`TaskExecutor`]
#[derive(Clone)]
pub struct ExecutionContext {
    /// Worker running the task
    pub worker_id: String,
    /// Task being executed
    pub task_id: String,
    cancel: CancelSignal,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl ExecutionContext {
    /// Create a context without a progress sink
    pub fn new(
        worker_id: impl Into<String>,
        task_id: impl Into<String>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            task_id: task_id.into(),
            cancel,
            progress: None,
        }
    }

    /// Attach a progress sink
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail out with a cancellation error when the signal is set
    pub fn check_cancelled(&self) -> WorkerResult<()> {
        if self.cancel.is_cancelled() {
            Err(WorkerError::cancelled(self.task_id.clone()))
        } else {
            Ok(())
        }
    }

    /// Report a phase transition
    pub fn set_phase(&self, phase: ExecutionPhase) {
        if let Some(sink) = &self.progress {
            sink.set_phase(phase);
        }
    }

    /// Report entering a processing step
    pub fn begin_step(&self, step: usize, total_steps: usize) {
        if let Some(sink) = &self.progress {
            sink.begin_step(step, total_steps);
        }
    }

    /// Report a partial result
    pub fn push_partial(&self, value: Value) {
        if let Some(sink) = &self.progress {
            sink.push_partial(value);
        }
    }

    /// Report an artifact
    pub fn add_artifact(&self, artifact: TaskArtifact) {
        if let Some(sink) = &self.progress {
            sink.add_artifact(artifact);
        }
    }

    /// Store a context entry
    pub fn set_context(&self, key: impl Into<String>, value: Value) {
        if let Some(sink) = &self.progress {
            sink.set_context(key.into(), value);
        }
    }
}

/// Execution seam: the logic a worker runs for each admitted task
///
/// Injected at construction; the worker owns everything around the call
/// (admission, load, metrics, events), the executor owns the work itself.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Prepare executor-owned resources; called from `Worker::initialize`
    async fn warmup(&self, worker_id: &str) -> WorkerResult<()> {
        let _ = worker_id;
        Ok(())
    }

    /// Run one task to completion
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> WorkerResult<TaskOutput>;

    /// Release executor-owned resources; called from `Worker::shutdown`
    async fn teardown(&self, worker_id: &str) -> WorkerResult<()> {
        let _ = worker_id;
        Ok(())
    }
}

/// Shared reference to a task executor
pub type SharedTaskExecutor = Arc<dyn TaskExecutor>;

/// Built-in executor that simulates work with short sleeps
///
/// Structured task input steers it: `duration_ms` stretches the simulated
/// work, `fail_with` makes the execution fail with the given message after
/// the work completes.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    /// Sleep per simulated step
    pub step_delay_ms: u64,
    /// Number of simulated steps
    pub steps: usize,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self {
            step_delay_ms: 25,
            steps: 4,
        }
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> WorkerResult<TaskOutput> {
        let steps = self.steps.max(1);
        let chunk_ms = match task.input_u64("duration_ms") {
            Some(total) => (total / steps as u64).max(1),
            None => self.step_delay_ms,
        };

        for step in 0..steps {
            ctx.check_cancelled()?;
            ctx.begin_step(step + 1, steps);
            tokio::time::sleep(std::time::Duration::from_millis(chunk_ms)).await;
        }

        if let Some(reason) = task.input_str("fail_with") {
            return Err(WorkerError::execution(reason));
        }

        let summary: String = task.description.chars().take(80).collect();
        Ok(
            TaskOutput::succeeded(
                &task.id,
                &ctx.worker_id,
                Some(serde_json::json!({
                    "task_type": task.task_type,
                    "summary": summary,
                    "steps_completed": steps,
                })),
            )
            .with_tokens_used(estimate_tokens(&task.description)),
        )
    }
}

/// The worker contract shared by all implementations
#[async_trait]
pub trait Worker: Send + Sync {
    /// Unique worker id
    fn id(&self) -> &str;

    /// Worker type tag
    fn worker_type(&self) -> &str;

    /// Full construction config (recovery respawns from this)
    fn config(&self) -> &WorkerConfig;

    /// Current lifecycle status
    fn status(&self) -> WorkerStatus;

    /// Load factor in [0, 1]: active tasks over the concurrency ceiling
    fn load(&self) -> f64;

    /// Number of tasks currently in flight
    fn active_tasks(&self) -> usize;

    /// Snapshot of the running metrics
    fn metrics(&self) -> WorkerMetrics;

    /// Composite health evaluation
    fn health(&self) -> WorkerHealth;

    /// Cosine similarity of this worker's specialization to an embedding
    fn similarity(&self, embedding: &[f32]) -> f32;

    /// Transition spawning → idle; idempotent
    async fn initialize(&self) -> WorkerResult<()>;

    /// Admit and execute one task
    ///
    /// Errors only for admission problems (capacity, status, invalid task);
    /// execution failures come back as `TaskOutput { success: false }`.
    async fn execute_task(&self, task: Task) -> WorkerResult<TaskOutput>;

    /// Shut the worker down; idempotent
    async fn shutdown(&self) -> WorkerResult<()>;

    /// Enqueue a message on this worker's queue
    fn push_message(&self, message: WorkerMessage);

    /// Drain all queued messages
    fn drain_messages(&self) -> Vec<WorkerMessage>;
}

impl std::fmt::Debug for dyn Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("worker_type", &self.worker_type())
            .finish_non_exhaustive()
    }
}

/// Shared reference to a worker
pub type SharedWorker = Arc<dyn Worker>;
