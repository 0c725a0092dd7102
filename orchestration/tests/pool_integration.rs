//! Pool integration: spawn, route, execute, and shut down through the
//! public surface with simulated executors. No external services involved.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use swarm_pool::{
    EventBus, ExecutionContext, PoolConfig, PoolError, PoolResult, SharedWorker,
    SpecializationProfile, SpecializedWorker, SpawnOptions, SwarmEvent, Task, TaskExecutor,
    TaskOutput, TerminationReason, Worker, WorkerBase, WorkerConfig, WorkerError, WorkerFactory,
    WorkerPool, WorkerResult,
};
use tokio::sync::Notify;

fn caps(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Routing end to end
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_pool_routes_by_capability_end_to_end() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let pool = WorkerPool::new(PoolConfig::default(), EventBus::new().shared()).unwrap();

    pool.spawn_worker(
        WorkerConfig::new("w-review", "code-review")
            .with_capabilities(caps(&["code-review", "static-analysis"])),
        SpawnOptions::default(),
    )
    .await
    .unwrap();
    pool.spawn_worker(
        WorkerConfig::new("w-test", "testing")
            .with_capabilities(caps(&["testing", "test-generation"])),
        SpawnOptions::default(),
    )
    .await
    .unwrap();
    pool.spawn_worker(
        WorkerConfig::new("w-docs", "documentation")
            .with_capabilities(caps(&["documentation", "technical-writing"])),
        SpawnOptions::default(),
    )
    .await
    .unwrap();

    let review = pool
        .execute_task(Task::new("t-1", "code-review", "review the auth module diff"))
        .await
        .unwrap();
    assert_eq!(review.worker_id, "w-review");

    let test = pool
        .execute_task(Task::new("t-2", "testing", "run the unit tests"))
        .await
        .unwrap();
    assert_eq!(test.worker_id, "w-test");

    let docs = pool
        .execute_task(Task::new("t-3", "documentation", "document the rollout plan"))
        .await
        .unwrap();
    assert_eq!(docs.worker_id, "w-docs");

    let stats = pool.stats().await;
    assert_eq!(stats.total_workers, 3);
    assert_eq!(stats.total_tasks_executed, 3);
    assert_eq!(stats.total_tasks_succeeded, 3);
    assert_eq!(stats.workers_by_type.get("code-review"), Some(&1));
    assert_eq!(stats.workers_by_type.get("testing"), Some(&1));
    assert_eq!(stats.workers_by_type.get("documentation"), Some(&1));
    assert_eq!(stats.workers_by_status.get("idle"), Some(&3));

    pool.shutdown().await.unwrap();
    assert!(pool.is_empty().await);
}

// ---------------------------------------------------------------------------
// Concurrency ceiling
// ---------------------------------------------------------------------------

/// Executor that parks every task until the shared gate opens.
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

#[tokio::test]
async fn test_single_worker_concurrency_ceiling() {
    let events = EventBus::new().shared();
    let gate = Arc::new(Notify::new());
    let factory_gate = gate.clone();
    let factory_events = events.clone();
    let factory = Arc::new(move |config: WorkerConfig| -> PoolResult<SharedWorker> {
        let worker = WorkerBase::new(
            config,
            Arc::new(GatedExecutor {
                gate: factory_gate.clone(),
            }),
            factory_events.clone(),
        )?;
        Ok(Arc::new(worker) as SharedWorker)
    });

    let pool = WorkerPool::with_factory(PoolConfig::default(), factory, events).unwrap();
    let worker = pool
        .spawn_worker(
            WorkerConfig::new("ts-1", "typescript")
                .with_capabilities(caps(&["typescript"]))
                .with_max_concurrent_tasks(1),
            SpawnOptions::default(),
        )
        .await
        .unwrap();

    let runner = worker.clone();
    let held = tokio::spawn(async move {
        runner
            .execute_task(Task::new("t-hold", "typescript", "long compile"))
            .await
    });
    while worker.active_tasks() == 0 {
        tokio::task::yield_now().await;
    }

    // The pool filters the saturated worker out entirely.
    let err = pool
        .execute_task(Task::new("t-routed", "typescript", "quick lint"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::NoAvailableWorker { .. }));

    // Going straight at the worker hits its own admission check, with no
    // accounting side effects.
    let err = worker
        .execute_task(Task::new("t-direct", "typescript", "quick lint"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::AtCapacity { .. }));
    assert_eq!(worker.active_tasks(), 1);
    assert_eq!(worker.metrics().tasks_executed, 0);

    gate.notify_one();
    let output = held.await.unwrap().unwrap();
    assert!(output.success);

    // Capacity freed: the pool routes to it again.
    gate.notify_one();
    let output = pool
        .execute_task(Task::new("t-after", "typescript", "quick lint"))
        .await
        .unwrap();
    assert_eq!(output.worker_id, "ts-1");
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_event_stream_covers_lifecycle() {
    let events = EventBus::new().shared();
    let mut rx = events.subscribe();
    let pool = WorkerPool::new(PoolConfig::default(), events).unwrap();

    pool.spawn_worker(
        WorkerConfig::new("w-1", "general"),
        SpawnOptions::default(),
    )
    .await
    .unwrap();
    pool.execute_task(Task::new("t-ok", "general", "fine"))
        .await
        .unwrap();
    let failed = pool
        .execute_task(
            Task::new("t-bad", "general", "doomed").with_input(json!({"fail_with": "boom"})),
        )
        .await
        .unwrap();
    assert!(!failed.success);
    pool.shutdown().await.unwrap();

    let mut kinds = Vec::new();
    let mut shutdown_reason = None;
    while let Ok(event) = rx.try_recv() {
        if let SwarmEvent::WorkerTerminated { reason, .. } = &event {
            shutdown_reason = Some(*reason);
        }
        kinds.push(event.event_type());
    }

    for expected in [
        "worker_created",
        "worker_spawned",
        "worker_initialized",
        "task_started",
        "task_completed",
        "task_failed",
        "worker_terminated",
    ] {
        assert!(kinds.contains(&expected), "missing event {expected}: {kinds:?}");
    }
    assert_eq!(shutdown_reason, Some(TerminationReason::Shutdown));
}

// ---------------------------------------------------------------------------
// Specialized workers competing inside a pool
// ---------------------------------------------------------------------------

/// Factory producing a specialized worker whose profile follows its type.
struct ProfiledFactory {
    events: swarm_pool::SharedEventBus,
}

#[async_trait]
impl WorkerFactory for ProfiledFactory {
    async fn build(&self, config: WorkerConfig) -> PoolResult<SharedWorker> {
        let profile = match config.worker_type.as_str() {
            "rust" => SpecializationProfile::new("rust")
                .with_skill("rust", 0.9)
                .with_skill("testing", 0.7),
            other => SpecializationProfile::new(other),
        };
        let worker =
            SpecializedWorker::with_simulated_executor(config, profile, self.events.clone())?;
        Ok(Arc::new(worker) as SharedWorker)
    }
}

#[tokio::test(start_paused = true)]
async fn test_specialized_workers_compete_in_pool() {
    let events = EventBus::new().shared();
    let pool = WorkerPool::with_factory(
        PoolConfig::default(),
        Arc::new(ProfiledFactory {
            events: events.clone(),
        }),
        events,
    )
    .unwrap();

    let rust = pool
        .spawn_worker(
            WorkerConfig::new("rust-expert", "rust")
                .with_capabilities(caps(&["code-generation", "rust"])),
            SpawnOptions::default(),
        )
        .await
        .unwrap();
    pool.spawn_worker(
        WorkerConfig::new("python-expert", "python").with_capabilities(caps(&["python"])),
        SpawnOptions::default(),
    )
    .await
    .unwrap();

    let task = Task::new("t-gen", "code-generation", "implement rust parser");
    let output = pool.execute_task(task).await.unwrap();
    assert_eq!(output.worker_id, "rust-expert");
    assert_eq!(rust.metrics().tasks_succeeded, 1);
}
