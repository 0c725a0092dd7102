//! Long-running worker integration: durable checkpoints, resume across
//! worker instances, the retry ladder, and cooperative cancellation.
//!
//! Everything runs on a paused clock; sleeps and backoff waits advance
//! virtually.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use swarm_pool::{
    CheckpointStore, EventBus, ExecutionContext, ExecutionPhase, FileCheckpointStore,
    LongRunningConfig, LongRunningWorker, MemoryCheckpointStore, StagedExecutor, SwarmEvent, Task,
    TaskOutput, Worker, WorkerConfig, WorkerError, WorkerResult,
};

fn fast_lr() -> LongRunningConfig {
    LongRunningConfig {
        checkpoint_interval_ms: 10_000,
        progress_interval_ms: 5_000,
        max_retries: 3,
        retry_backoff: 2.0,
        auto_retry: true,
        task_timeout_ms: 0,
        max_checkpoints: 10,
        auto_cleanup: true,
        default_total_steps: 4,
    }
}

// ---------------------------------------------------------------------------
// Durable resume across worker instances
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_failed_run_resumes_on_fresh_worker() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));
    let events = EventBus::new().shared();

    let lr = LongRunningConfig {
        auto_retry: false,
        ..fast_lr()
    };
    let worker = LongRunningWorker::with_default_executor(
        WorkerConfig::new("lr-1", "pipeline"),
        lr.clone(),
        store.clone(),
        events.clone(),
    )
    .unwrap();
    worker.initialize().await.unwrap();

    let task = Task::new("t-pipeline", "pipeline", "nightly data crunch")
        .with_input(json!({"total_steps": 4, "fail_at_step": 3}));
    let output = worker.execute_task(task).await.unwrap();
    assert!(!output.success);

    // The failure left a snapshot on disk, referenced from the output.
    let checkpoint_id = output.metadata_str("checkpoint_id").unwrap().to_string();
    let snapshot = store.load(&checkpoint_id).await.unwrap();
    assert_eq!(snapshot.task_id, "t-pipeline");
    assert_eq!(snapshot.state.step, 3);
    assert_eq!(snapshot.state.partial_results.len(), 2);

    // A brand-new worker instance picks the work up from the same store.
    let successor = LongRunningWorker::with_default_executor(
        WorkerConfig::new("lr-2", "pipeline"),
        lr,
        store.clone(),
        events,
    )
    .unwrap();
    successor.initialize().await.unwrap();
    let resumed = successor
        .resume_from_checkpoint(&checkpoint_id)
        .await
        .unwrap();
    assert!(resumed.success);
    assert_eq!(resumed.task_id, "t-pipeline");

    // Success swept the task's checkpoints, including the predecessor's.
    assert!(store.list("t-pipeline", "lr-1").await.unwrap().is_empty());
    assert!(store.list("t-pipeline", "lr-2").await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Retry ladder
// ---------------------------------------------------------------------------

/// Staged executor that fails a fixed number of runs before succeeding.
struct FlakyExecutor {
    failures_remaining: AtomicU32,
}

#[async_trait]
impl StagedExecutor for FlakyExecutor {
    async fn run(&self, task: &Task, ctx: &ExecutionContext) -> WorkerResult<TaskOutput> {
        ctx.set_phase(ExecutionPhase::Processing);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.failures_remaining.load(Ordering::SeqCst) > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(WorkerError::execution("upstream hiccup"));
        }
        Ok(TaskOutput::succeeded(
            &task.id,
            &ctx.worker_id,
            Some(json!({"ok": true})),
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_ladder_waits_out_backoff() {
    let events = EventBus::new().shared();
    let worker = LongRunningWorker::new(
        WorkerConfig::new("lr-flaky", "pipeline"),
        fast_lr(),
        Arc::new(FlakyExecutor {
            failures_remaining: AtomicU32::new(2),
        }),
        Arc::new(MemoryCheckpointStore::new()),
        events,
    )
    .unwrap();
    worker.initialize().await.unwrap();

    let started = tokio::time::Instant::now();
    let output = worker
        .execute_task(Task::new("t-flaky", "pipeline", "eventually settles"))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(output.success);
    assert_eq!(output.metadata.get("attempts"), Some(&json!(3)));
    // Two failures cost 1000ms and 2000ms of backoff on the virtual clock.
    assert!(
        elapsed >= Duration::from_millis(3000) && elapsed < Duration::from_millis(3600),
        "unexpected retry schedule: {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Periodic checkpoints and retention
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_periodic_checkpoints_persist_with_retention() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));
    let events = EventBus::new().shared();
    let mut rx = events.subscribe();

    let worker = LongRunningWorker::with_default_executor(
        WorkerConfig::new("lr-steady", "pipeline"),
        LongRunningConfig {
            checkpoint_interval_ms: 100,
            progress_interval_ms: 200,
            max_checkpoints: 2,
            auto_cleanup: false,
            auto_retry: false,
            default_total_steps: 8,
            ..fast_lr()
        },
        store.clone(),
        events,
    )
    .unwrap();
    worker.initialize().await.unwrap();

    let output = worker
        .execute_task(Task::new("t-steady", "pipeline", "slow burn"))
        .await
        .unwrap();
    assert!(output.success);
    assert!(worker.checkpoints_created() > 2);

    // Retention kept only the newest snapshots, in sequence order.
    let kept = store.list("t-steady", "lr-steady").await.unwrap();
    assert!(!kept.is_empty() && kept.len() <= 2, "kept {}", kept.len());
    for pair in kept.windows(2) {
        assert!(pair[0].sequence < pair[1].sequence);
    }

    // What the store lists is what actually sits on disk.
    let on_disk = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        .count();
    assert_eq!(on_disk, kept.len());

    let mut saves = 0;
    let mut progress_seen = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            SwarmEvent::CheckpointSaved { .. } => saves += 1,
            SwarmEvent::Progress { progress, .. } => {
                assert!(progress > 0.0 && progress <= 0.95);
                progress_seen = true;
            }
            _ => {}
        }
    }
    assert!(saves > 2, "expected periodic saves, saw {saves}");
    assert!(progress_seen);
}

// ---------------------------------------------------------------------------
// Cooperative cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_cancellation_persists_snapshot() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let events = EventBus::new().shared();
    let worker = Arc::new(
        LongRunningWorker::with_default_executor(
            WorkerConfig::new("lr-cancel", "pipeline"),
            LongRunningConfig {
                auto_retry: false,
                ..fast_lr()
            },
            store.clone() as Arc<dyn CheckpointStore>,
            events,
        )
        .unwrap(),
    );
    worker.initialize().await.unwrap();

    let runner = worker.clone();
    let handle = tokio::spawn(async move {
        runner
            .execute_task(
                Task::new("t-cancel", "pipeline", "very long crunch")
                    .with_input(json!({"total_steps": 50})),
            )
            .await
    });
    while worker.active_tasks() == 0 {
        tokio::task::yield_now().await;
    }

    let snapshot_id = worker.cancel_task().await.unwrap().unwrap();
    let output = handle.await.unwrap().unwrap();
    assert!(!output.success);
    assert!(output.error.as_deref().unwrap_or_default().contains("cancelled"));

    // The cancel-time snapshot is loadable and tied to the task.
    let snapshot = store.load(&snapshot_id).await.unwrap();
    assert_eq!(snapshot.task_id, "t-cancel");

    // The worker is reusable afterwards.
    let output = worker
        .execute_task(Task::new("t-next", "pipeline", "short job"))
        .await
        .unwrap();
    assert!(output.success);
}
