//! Base worker: lifecycle, admission, and execution accounting
//!
//! [`WorkerBase`] owns everything that surrounds a task execution: status
//! transitions, the concurrency ceiling, load and metrics accounting, health
//! evaluation, and event publication. The work itself lives behind the
//! injected [`TaskExecutor`]. Specialized and long-running workers embed a
//! `WorkerBase` and wrap its admission bracket (`begin_task` / `finish_task`)
//! around their own execution pipelines.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::embedding::{capability_embedding, cosine_similarity};
use crate::events::{SharedEventBus, SwarmEvent};
use crate::task::{Task, TaskOutput};

use super::{
    CancelSignal, ExecutionContext, HealthStatus, SharedTaskExecutor, SimulatedExecutor,
    TaskExecutor, Worker, WorkerConfig, WorkerError, WorkerHealth, WorkerMessage, WorkerMetrics,
    WorkerResult, WorkerStatus,
};

/// Queue bound for inter-worker messages; oldest entries drop on overflow
const MESSAGE_QUEUE_LIMIT: usize = 256;

/// Mutable worker state behind one lock
#[derive(Debug)]
struct BaseState {
    status: WorkerStatus,
    active_tasks: usize,
    load: f64,
    metrics: WorkerMetrics,
    messages: VecDeque<WorkerMessage>,
}

/// Foundation worker with pluggable execution logic
pub struct WorkerBase {
    config: Arc<WorkerConfig>,
    embedding: Vec<f32>,
    executor: SharedTaskExecutor,
    events: SharedEventBus,
    state: Mutex<BaseState>,
}

impl WorkerBase {
    /// Create a worker from a validated config and an injected executor
    ///
    /// The specialization embedding is resolved here: an explicit one from
    /// the config wins, otherwise it is derived from the capability set.
    pub fn new(
        config: WorkerConfig,
        executor: SharedTaskExecutor,
        events: SharedEventBus,
    ) -> WorkerResult<Self> {
        config.validate()?;

        let embedding = match &config.specialization {
            Some(explicit) => explicit.clone(),
            None => capability_embedding(&config.capabilities),
        };

        events.publish(SwarmEvent::WorkerCreated {
            worker_id: config.id.clone(),
            worker_type: config.worker_type.clone(),
            timestamp: Utc::now(),
        });

        Ok(Self {
            config: Arc::new(config),
            embedding,
            executor,
            events,
            state: Mutex::new(BaseState {
                status: WorkerStatus::Spawning,
                active_tasks: 0,
                load: 0.0,
                metrics: WorkerMetrics::default(),
                messages: VecDeque::new(),
            }),
        })
    }

    /// Create a worker backed by the built-in simulated executor
    pub fn with_simulated_executor(
        config: WorkerConfig,
        events: SharedEventBus,
    ) -> WorkerResult<Self> {
        Self::new(config, Arc::new(SimulatedExecutor::default()), events)
    }

    fn state(&self) -> WorkerResult<MutexGuard<'_, BaseState>> {
        self.state.lock().map_err(|_| WorkerError::LockPoisoned)
    }

    /// Worker id
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Worker type tag
    pub fn worker_type(&self) -> &str {
        &self.config.worker_type
    }

    /// Construction config
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Event bus this worker publishes on
    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    /// The injected executor
    pub fn executor(&self) -> &SharedTaskExecutor {
        &self.executor
    }

    /// Resolved specialization embedding
    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    /// Admit a task: reserve a concurrency slot and mark the worker busy
    ///
    /// Rejection happens before any state change, so a refused task leaves
    /// no trace in load or metrics.
    pub fn begin_task(&self, task: &Task) -> WorkerResult<()> {
        if task.id.trim().is_empty() {
            return Err(WorkerError::invalid_task("task id is empty"));
        }

        let mut state = self.state()?;
        if !state.status.accepts_tasks() {
            return Err(WorkerError::NotAvailable {
                worker_id: self.config.id.clone(),
                status: state.status,
            });
        }
        if state.active_tasks >= self.config.max_concurrent_tasks {
            return Err(WorkerError::AtCapacity {
                worker_id: self.config.id.clone(),
                active: state.active_tasks,
                max_concurrent: self.config.max_concurrent_tasks,
            });
        }

        state.active_tasks += 1;
        state.load = state.active_tasks as f64 / self.config.max_concurrent_tasks as f64;
        state.status = WorkerStatus::Busy;
        drop(state);

        debug!(
            worker_id = %self.config.id,
            task_id = %task.id,
            task_type = %task.task_type,
            "task admitted"
        );
        self.events.publish(SwarmEvent::TaskStarted {
            worker_id: self.config.id.clone(),
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Settle an admitted task: release the slot and fold in the outcome
    ///
    /// Execution errors are converted into a failed [`TaskOutput`] here; once
    /// a task has been admitted the caller always gets an output back, never
    /// an execution error.
    pub fn finish_task(
        &self,
        task: &Task,
        outcome: WorkerResult<TaskOutput>,
        elapsed_ms: u64,
    ) -> WorkerResult<TaskOutput> {
        let output = match outcome {
            Ok(output) if output.duration_ms == 0 => output.with_duration_ms(elapsed_ms),
            Ok(output) => output,
            Err(err) => {
                warn!(
                    worker_id = %self.config.id,
                    task_id = %task.id,
                    error = %err,
                    "task execution failed"
                );
                TaskOutput::failed(&task.id, &self.config.id, err.to_string())
                    .with_duration_ms(elapsed_ms)
            }
        };

        {
            let mut state = self.state()?;
            state.active_tasks = state.active_tasks.saturating_sub(1);
            state.load = state.active_tasks as f64 / self.config.max_concurrent_tasks as f64;
            // A worker terminated mid-flight stays terminated.
            if state.status == WorkerStatus::Busy && state.active_tasks == 0 {
                state.status = WorkerStatus::Idle;
            }
            state
                .metrics
                .record(output.duration_ms, output.tokens_used, output.success);
        }

        if output.success {
            self.events.publish(SwarmEvent::TaskCompleted {
                worker_id: self.config.id.clone(),
                task_id: task.id.clone(),
                duration_ms: output.duration_ms,
                tokens_used: output.tokens_used,
                timestamp: Utc::now(),
            });
        } else {
            self.events.publish(SwarmEvent::TaskFailed {
                worker_id: self.config.id.clone(),
                task_id: task.id.clone(),
                error: output.error.clone().unwrap_or_default(),
                timestamp: Utc::now(),
            });
        }
        Ok(output)
    }

    /// Initialize the worker; safe to call repeatedly
    pub async fn initialize(&self) -> WorkerResult<()> {
        {
            let state = self.state()?;
            match state.status {
                WorkerStatus::Idle | WorkerStatus::Busy => return Ok(()),
                WorkerStatus::Terminated => {
                    return Err(WorkerError::NotAvailable {
                        worker_id: self.config.id.clone(),
                        status: WorkerStatus::Terminated,
                    })
                }
                WorkerStatus::Spawning | WorkerStatus::Error => {}
            }
        }

        self.events.publish(SwarmEvent::WorkerInitializing {
            worker_id: self.config.id.clone(),
            timestamp: Utc::now(),
        });
        info!(
            worker_id = %self.config.id,
            worker_type = %self.config.worker_type,
            "initializing worker"
        );

        if let Err(err) = self.executor.warmup(&self.config.id).await {
            self.state()?.status = WorkerStatus::Error;
            warn!(worker_id = %self.config.id, error = %err, "worker initialization failed");
            return Err(WorkerError::initialization(
                &self.config.id,
                err.to_string(),
            ));
        }

        self.state()?.status = WorkerStatus::Idle;
        self.events.publish(SwarmEvent::WorkerInitialized {
            worker_id: self.config.id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Run one task end to end through the admission bracket
    pub async fn execute_task(&self, task: Task) -> WorkerResult<TaskOutput> {
        self.begin_task(&task)?;
        let started = tokio::time::Instant::now();
        let ctx = ExecutionContext::new(&self.config.id, &task.id, CancelSignal::new());
        let outcome = self.executor.execute(&task, &ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.finish_task(&task, outcome, elapsed_ms)
    }

    /// Shut the worker down; safe to call repeatedly
    ///
    /// The worker is marked terminated before the teardown hook runs, so a
    /// failing hook still leaves it closed to new tasks. The hook's error is
    /// returned to the caller.
    pub async fn shutdown(&self) -> WorkerResult<()> {
        {
            let mut state = self.state()?;
            if state.status == WorkerStatus::Terminated {
                return Ok(());
            }
            state.status = WorkerStatus::Terminated;
        }

        let result = self.executor.teardown(&self.config.id).await;
        if let Err(err) = &result {
            warn!(worker_id = %self.config.id, error = %err, "shutdown hook failed");
        }
        info!(worker_id = %self.config.id, "worker shut down");
        self.events.publish(SwarmEvent::WorkerShutdown {
            worker_id: self.config.id.clone(),
            timestamp: Utc::now(),
        });
        result
    }

    /// Current lifecycle status
    pub fn status(&self) -> WorkerStatus {
        self.state
            .lock()
            .map(|s| s.status)
            .unwrap_or(WorkerStatus::Error)
    }

    /// Load factor in [0, 1]
    pub fn load(&self) -> f64 {
        self.state.lock().map(|s| s.load).unwrap_or(1.0)
    }

    /// Tasks currently in flight
    pub fn active_tasks(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.active_tasks)
            .unwrap_or(self.config.max_concurrent_tasks)
    }

    /// Snapshot of the running metrics
    pub fn metrics(&self) -> WorkerMetrics {
        self.state
            .lock()
            .map(|s| s.metrics.clone())
            .unwrap_or_default()
    }

    /// Evaluate health from the current metrics and load
    pub fn health(&self) -> WorkerHealth {
        match self.state.lock() {
            Ok(state) => WorkerHealth::evaluate(&state.metrics, state.load),
            Err(_) => WorkerHealth {
                status: HealthStatus::Unhealthy,
                score: 0.0,
                load: 1.0,
                issues: vec!["worker state lock poisoned".to_string()],
            },
        }
    }

    /// Cosine similarity of this worker's specialization to an embedding
    pub fn similarity(&self, embedding: &[f32]) -> f32 {
        cosine_similarity(&self.embedding, embedding)
    }

    /// Enqueue a message for this worker
    pub fn push_message(&self, message: WorkerMessage) {
        if let Ok(mut state) = self.state.lock() {
            if state.messages.len() >= MESSAGE_QUEUE_LIMIT {
                state.messages.pop_front();
            }
            state.messages.push_back(message);
        }
    }

    /// Drain all queued messages
    pub fn drain_messages(&self) -> Vec<WorkerMessage> {
        self.state
            .lock()
            .map(|mut s| s.messages.drain(..).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Worker for WorkerBase {
    fn id(&self) -> &str {
        WorkerBase::id(self)
    }

    fn worker_type(&self) -> &str {
        WorkerBase::worker_type(self)
    }

    fn config(&self) -> &WorkerConfig {
        WorkerBase::config(self)
    }

    fn status(&self) -> WorkerStatus {
        WorkerBase::status(self)
    }

    fn load(&self) -> f64 {
        WorkerBase::load(self)
    }

    fn active_tasks(&self) -> usize {
        WorkerBase::active_tasks(self)
    }

    fn metrics(&self) -> WorkerMetrics {
        WorkerBase::metrics(self)
    }

    fn health(&self) -> WorkerHealth {
        WorkerBase::health(self)
    }

    fn similarity(&self, embedding: &[f32]) -> f32 {
        WorkerBase::similarity(self, embedding)
    }

    async fn initialize(&self) -> WorkerResult<()> {
        WorkerBase::initialize(self).await
    }

    async fn execute_task(&self, task: Task) -> WorkerResult<TaskOutput> {
        WorkerBase::execute_task(self, task).await
    }

    async fn shutdown(&self) -> WorkerResult<()> {
        WorkerBase::shutdown(self).await
    }

    fn push_message(&self, message: WorkerMessage) {
        WorkerBase::push_message(self, message)
    }

    fn drain_messages(&self) -> Vec<WorkerMessage> {
        WorkerBase::drain_messages(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use serde_json::json;
    use tokio::sync::Notify;

    fn test_worker(config: WorkerConfig) -> WorkerBase {
        WorkerBase::with_simulated_executor(config, EventBus::new().shared()).unwrap()
    }

    /// Executor that holds each task until the gate is released
    struct GatedExecutor {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl TaskExecutor for GatedExecutor {
        async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> WorkerResult<TaskOutput> {
            self.gate.notified().await;
            Ok(TaskOutput::succeeded(&task.id, &ctx.worker_id, None))
        }
    }

    /// Executor whose warmup hook always fails
    struct BrokenWarmup;

    #[async_trait]
    impl TaskExecutor for BrokenWarmup {
        async fn warmup(&self, _worker_id: &str) -> WorkerResult<()> {
            Err(WorkerError::execution("model endpoint unreachable"))
        }

        async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> WorkerResult<TaskOutput> {
            Ok(TaskOutput::succeeded(&task.id, &ctx.worker_id, None))
        }
    }

    /// Executor whose teardown hook always fails
    struct BrokenTeardown;

    #[async_trait]
    impl TaskExecutor for BrokenTeardown {
        async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> WorkerResult<TaskOutput> {
            Ok(TaskOutput::succeeded(&task.id, &ctx.worker_id, None))
        }

        async fn teardown(&self, _worker_id: &str) -> WorkerResult<()> {
            Err(WorkerError::execution("session flush failed"))
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let worker = test_worker(WorkerConfig::new("w-1", "general"));
        assert_eq!(WorkerBase::status(&worker), WorkerStatus::Spawning);

        worker.initialize().await.unwrap();
        assert_eq!(WorkerBase::status(&worker), WorkerStatus::Idle);

        worker.initialize().await.unwrap();
        assert_eq!(WorkerBase::status(&worker), WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_failed_warmup_sets_error_status() {
        let worker = WorkerBase::new(
            WorkerConfig::new("w-1", "general"),
            Arc::new(BrokenWarmup),
            EventBus::new().shared(),
        )
        .unwrap();

        let err = worker.initialize().await.unwrap_err();
        assert!(matches!(err, WorkerError::InitializationFailed { .. }));
        assert_eq!(WorkerBase::status(&worker), WorkerStatus::Error);
    }

    #[tokio::test]
    async fn test_execute_before_initialize_is_rejected() {
        let worker = test_worker(WorkerConfig::new("w-1", "general"));
        let err = worker
            .execute_task(Task::new("t-1", "general", "too early"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NotAvailable { .. }));
    }

    #[tokio::test]
    async fn test_single_slot_worker_rejects_concurrent_task() {
        let gate = Arc::new(Notify::new());
        let worker = Arc::new(
            WorkerBase::new(
                WorkerConfig::new("ts-worker", "typescript")
                    .with_capability("typescript")
                    .with_max_concurrent_tasks(1),
                Arc::new(GatedExecutor { gate: gate.clone() }),
                EventBus::new().shared(),
            )
            .unwrap(),
        );
        worker.initialize().await.unwrap();

        let first = worker.clone();
        let handle = tokio::spawn(async move {
            first
                .execute_task(Task::new("t-1", "typescript", "compile"))
                .await
        });
        // Let the spawned task claim the only slot.
        while WorkerBase::active_tasks(&worker) == 0 {
            tokio::task::yield_now().await;
        }

        let err = worker
            .execute_task(Task::new("t-2", "typescript", "rejected"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::AtCapacity { .. }));
        // The rejection left the in-flight accounting untouched.
        assert_eq!(WorkerBase::active_tasks(&worker), 1);
        assert_eq!(WorkerBase::status(&worker), WorkerStatus::Busy);

        gate.notify_one();
        let output = handle.await.unwrap().unwrap();
        assert!(output.success);

        assert_eq!(WorkerBase::active_tasks(&worker), 0);
        assert_eq!(WorkerBase::status(&worker), WorkerStatus::Idle);
        let metrics = WorkerBase::metrics(&worker);
        assert_eq!(metrics.tasks_executed, 1);
        assert_eq!(metrics.tasks_succeeded, 1);
    }

    #[tokio::test]
    async fn test_execution_failure_becomes_failed_output() {
        let worker = test_worker(WorkerConfig::new("w-1", "general"));
        worker.initialize().await.unwrap();

        let bus = worker.events().clone();
        let mut rx = bus.subscribe();

        let task = Task::new("t-1", "general", "doomed")
            .with_input(json!({"fail_with": "synthetic failure"}));
        let output = worker.execute_task(task).await.unwrap();
        assert!(!output.success);
        assert!(output
            .error
            .as_deref()
            .map(|e| e.contains("synthetic failure"))
            .unwrap_or(false));

        let metrics = WorkerBase::metrics(&worker);
        assert_eq!(metrics.tasks_executed, 1);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(WorkerBase::status(&worker), WorkerStatus::Idle);

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SwarmEvent::TaskFailed { .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_surfaces_hook_error() {
        let worker = WorkerBase::new(
            WorkerConfig::new("w-1", "general"),
            Arc::new(BrokenTeardown),
            EventBus::new().shared(),
        )
        .unwrap();
        worker.initialize().await.unwrap();

        let err = worker.shutdown().await.unwrap_err();
        assert!(matches!(err, WorkerError::Execution { .. }));
        // The hook failed but the worker is still closed for business.
        assert_eq!(WorkerBase::status(&worker), WorkerStatus::Terminated);

        worker.shutdown().await.unwrap();
        assert_eq!(WorkerBase::status(&worker), WorkerStatus::Terminated);

        let err = worker
            .execute_task(Task::new("t-1", "general", "after shutdown"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NotAvailable { .. }));
    }

    #[tokio::test]
    async fn test_duration_is_filled_from_elapsed_time() {
        tokio::time::pause();
        let worker = test_worker(WorkerConfig::new("w-1", "general"));
        worker.initialize().await.unwrap();

        let task =
            Task::new("t-1", "general", "timed").with_input(json!({"duration_ms": 400_u64}));
        let output = worker.execute_task(task).await.unwrap();
        assert!(output.success);
        assert!(output.duration_ms >= 400);

        let metrics = WorkerBase::metrics(&worker);
        assert!(metrics.avg_duration_ms >= 400.0);
    }

    #[test]
    fn test_capability_embedding_similarity() {
        let rust_worker = test_worker(
            WorkerConfig::new("w-rust", "rust")
                .with_capabilities(vec!["rust".into(), "code-generation".into()]),
        );
        let twin = test_worker(
            WorkerConfig::new("w-twin", "rust")
                .with_capabilities(vec!["rust".into(), "code-generation".into()]),
        );
        let other = test_worker(
            WorkerConfig::new("w-docs", "documentation")
                .with_capabilities(vec!["documentation".into(), "technical-writing".into()]),
        );

        let own = rust_worker.embedding().to_vec();
        assert!((WorkerBase::similarity(&twin, &own) - 1.0).abs() < 1e-5);
        assert!(WorkerBase::similarity(&other, &own) < 0.99);
    }

    #[tokio::test]
    async fn test_message_queue() {
        let worker = test_worker(WorkerConfig::new("w-1", "general"));
        worker.push_message(WorkerMessage::new("w-2", "w-1", "status", json!({"ok": true})));
        worker.push_message(WorkerMessage::new("w-3", "w-1", "status", json!({"ok": false})));

        let drained = WorkerBase::drain_messages(&worker);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].from, "w-2");
        assert!(WorkerBase::drain_messages(&worker).is_empty());
    }

    #[tokio::test]
    async fn test_empty_task_id_is_rejected() {
        let worker = test_worker(WorkerConfig::new("w-1", "general"));
        worker.initialize().await.unwrap();
        let err = worker
            .execute_task(Task::new("", "general", "anonymous"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidTask { .. }));
    }

    #[tokio::test]
    async fn test_health_reflects_failures() {
        tokio::time::pause();
        let worker = test_worker(WorkerConfig::new("w-1", "general"));
        worker.initialize().await.unwrap();

        for i in 0..4 {
            let task = Task::new(format!("t-{i}"), "general", "doomed")
                .with_input(json!({"fail_with": "boom", "duration_ms": 1_u64}));
            let output = worker.execute_task(task).await.unwrap();
            assert!(!output.success);
        }

        let health = WorkerBase::health(&worker);
        // 0.7 × 0 + 0.3 × 1 = 0.3
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.score < 0.5);
    }
}
