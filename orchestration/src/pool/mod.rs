//! Worker pool: spawning, routing, balancing, scaling, and recovery
//!
//! The pool owns a registry of [`SharedWorker`]s and routes each task to the
//! best candidate by a weighted blend of capability overlap, embedding
//! similarity, inverse load, and health. Background loops (started with
//! [`WorkerPool::start`]) sweep worker health and evaluate auto-scaling
//! against utilization thresholds; unhealthy workers are torn down and
//! respawned from their own construction config, keeping their identity.
//!
//! Routing reads a moment-in-time snapshot of worker load, so two tasks
//! routed concurrently can pick the same nearly-full worker and one of them
//! will bounce off its admission check. Callers retry by routing again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::embedding::task_embedding;
use crate::events::{SharedEventBus, SwarmEvent, TerminationReason};
use crate::task::{Task, TaskOutput};
use crate::worker::base::WorkerBase;
use crate::worker::specialized::infer_required_capabilities;
use crate::worker::{
    HealthStatus, SharedWorker, Worker, WorkerConfig, WorkerError, WorkerStatus,
};

/// Routing weight for capability overlap
const ROUTE_WEIGHT_CAPABILITY: f64 = 0.4;
/// Routing weight for embedding similarity
const ROUTE_WEIGHT_EMBEDDING: f64 = 0.3;
/// Routing weight for inverse load
const ROUTE_WEIGHT_LOAD: f64 = 0.2;
/// Routing weight for health score
const ROUTE_WEIGHT_HEALTH: f64 = 0.1;

/// Window of recently routed task types feeding scale-up decisions
const RECENT_TYPE_WINDOW: usize = 50;

/// Error type for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no available worker for task {task_id}")]
    NoAvailableWorker { task_id: String },

    #[error("worker {worker_id} not found")]
    WorkerNotFound { worker_id: String },

    #[error("worker {worker_id} is already registered")]
    DuplicateWorker { worker_id: String },

    #[error("pool is at its maximum of {max_workers} workers")]
    AtCapacity { max_workers: usize },

    #[error("invalid pool config: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl PoolError {
    fn invalid_config(reason: impl Into<String>) -> Self {
        PoolError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Shared reference to a worker pool
pub type SharedWorkerPool = Arc<WorkerPool>;

/// Strategy for computing advisory balance weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Equal weight for every worker
    RoundRobin,
    /// Favor workers with spare capacity
    LeastLoaded,
    /// Favor workers declaring broader capability sets
    CapabilityWeighted,
}

impl Default for LoadBalanceStrategy {
    fn default() -> Self {
        LoadBalanceStrategy::LeastLoaded
    }
}

impl std::fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalanceStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalanceStrategy::LeastLoaded => write!(f, "least_loaded"),
            LoadBalanceStrategy::CapabilityWeighted => write!(f, "capability_weighted"),
        }
    }
}

/// Pool-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Floor the auto-scaler never shrinks below
    pub min_workers: usize,
    /// Ceiling for registered workers
    pub max_workers: usize,
    /// Average utilization above which the pool grows
    pub scale_up_threshold: f64,
    /// Average utilization below which the pool shrinks
    pub scale_down_threshold: f64,
    /// Interval between health sweeps
    pub health_check_interval_ms: u64,
    /// Interval between scaling evaluations
    pub scale_interval_ms: u64,
    /// Advisory balance strategy
    pub strategy: LoadBalanceStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            health_check_interval_ms: 30_000,
            scale_interval_ms: 60_000,
            strategy: LoadBalanceStrategy::default(),
        }
    }
}

impl PoolConfig {
    /// Check the knobs for internal consistency
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_workers == 0 {
            return Err(PoolError::invalid_config("max_workers must be at least 1"));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::invalid_config(
                "min_workers cannot exceed max_workers",
            ));
        }
        if !(0.0..=1.0).contains(&self.scale_up_threshold)
            || !(0.0..=1.0).contains(&self.scale_down_threshold)
        {
            return Err(PoolError::invalid_config(
                "scaling thresholds must lie in [0, 1]",
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(PoolError::invalid_config(
                "scale_down_threshold must be below scale_up_threshold",
            ));
        }
        if self.health_check_interval_ms == 0 || self.scale_interval_ms == 0 {
            return Err(PoolError::invalid_config(
                "background intervals must be positive",
            ));
        }
        Ok(())
    }
}

/// One scored routing candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCandidate {
    /// Candidate worker id
    pub worker_id: String,
    /// Weighted composite routing score
    pub score: f64,
    /// Capability overlap sub-score
    pub capability_score: f64,
    /// Embedding similarity sub-score
    pub embedding_score: f64,
    /// Inverse load sub-score
    pub load_score: f64,
    /// Health sub-score
    pub health_score: f64,
}

/// Options for registering a worker
#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    /// Replace a worker that already holds this id (keeps its slot)
    pub replace_existing: bool,
    /// Initialize the worker right after registration
    pub auto_initialize: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            replace_existing: false,
            auto_initialize: true,
        }
    }
}

impl SpawnOptions {
    /// Allow replacing an existing worker with the same id
    pub fn replace(mut self) -> Self {
        self.replace_existing = true;
        self
    }

    /// Leave the worker in its spawning state after registration
    pub fn without_initialize(mut self) -> Self {
        self.auto_initialize = false;
        self
    }
}

/// Outcome of one auto-scaling evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    /// A worker was added
    ScaledUp { worker_id: String, worker_type: String },
    /// A worker was removed
    ScaledDown { worker_id: String },
}

/// Outcome of one health sweep
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    /// Healthy workers observed
    pub healthy: usize,
    /// Degraded workers observed
    pub degraded: usize,
    /// Unhealthy workers observed
    pub unhealthy: usize,
    /// Workers torn down and respawned this sweep
    pub recovered: Vec<String>,
}

/// Aggregated pool statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub total_active_tasks: usize,
    pub total_tasks_executed: u64,
    pub total_tasks_succeeded: u64,
    pub total_tasks_failed: u64,
    pub avg_load: f64,
    pub avg_health_score: f64,
    /// Worker count per worker type tag
    pub workers_by_type: HashMap<String, usize>,
    /// Worker count per lifecycle status
    pub workers_by_status: HashMap<String, usize>,
}

/// Construction seam for workers, so hosts control what the pool spawns
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Build a worker from its config
    async fn build(&self, config: WorkerConfig) -> PoolResult<SharedWorker>;
}

#[async_trait]
impl<F> WorkerFactory for F
where
    F: Fn(WorkerConfig) -> PoolResult<SharedWorker> + Send + Sync,
{
    async fn build(&self, config: WorkerConfig) -> PoolResult<SharedWorker> {
        (self)(config)
    }
}

/// Default factory producing simulated-executor base workers
pub struct DefaultWorkerFactory {
    events: SharedEventBus,
}

impl DefaultWorkerFactory {
    /// Create a factory publishing on the given bus
    pub fn new(events: SharedEventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl WorkerFactory for DefaultWorkerFactory {
    async fn build(&self, config: WorkerConfig) -> PoolResult<SharedWorker> {
        let worker = WorkerBase::with_simulated_executor(config, self.events.clone())?;
        Ok(Arc::new(worker))
    }
}

/// A managed collection of workers with routing and self-healing
pub struct WorkerPool {
    config: PoolConfig,
    workers: RwLock<Vec<SharedWorker>>,
    factory: Arc<dyn WorkerFactory>,
    weights: RwLock<HashMap<String, f64>>,
    recent_types: Mutex<VecDeque<String>>,
    events: SharedEventBus,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl WorkerPool {
    /// Create a pool with the default worker factory
    pub fn new(config: PoolConfig, events: SharedEventBus) -> PoolResult<Self> {
        let factory = Arc::new(DefaultWorkerFactory::new(events.clone()));
        Self::with_factory(config, factory, events)
    }

    /// Create a pool with a custom worker factory
    pub fn with_factory(
        config: PoolConfig,
        factory: Arc<dyn WorkerFactory>,
        events: SharedEventBus,
    ) -> PoolResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            workers: RwLock::new(Vec::new()),
            factory,
            weights: RwLock::new(HashMap::new()),
            recent_types: Mutex::new(VecDeque::new()),
            events,
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Wrap the pool in an `Arc` for sharing with background loops
    pub fn shared(self) -> SharedWorkerPool {
        Arc::new(self)
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Event bus the pool publishes on
    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    /// Number of registered workers
    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Whether the pool holds no workers
    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    /// Snapshot of the registered workers in spawn order
    pub async fn workers(&self) -> Vec<SharedWorker> {
        self.workers.read().await.iter().cloned().collect()
    }

    /// Look up a worker by id
    pub async fn get_worker(&self, worker_id: &str) -> Option<SharedWorker> {
        self.workers
            .read()
            .await
            .iter()
            .find(|w| w.id() == worker_id)
            .cloned()
    }

    /// Build and register a worker
    ///
    /// A duplicate id is an error unless `replace_existing` is set, in which
    /// case the newcomer takes over the old worker's slot and the old worker
    /// is shut down. With `auto_initialize`, an initialization failure is
    /// returned but the worker stays registered for later recovery.
    pub async fn spawn_worker(
        &self,
        config: WorkerConfig,
        opts: SpawnOptions,
    ) -> PoolResult<SharedWorker> {
        {
            let workers = self.workers.read().await;
            let exists = workers.iter().any(|w| w.id() == config.id);
            if exists && !opts.replace_existing {
                return Err(PoolError::DuplicateWorker {
                    worker_id: config.id,
                });
            }
            if !exists && workers.len() >= self.config.max_workers {
                return Err(PoolError::AtCapacity {
                    max_workers: self.config.max_workers,
                });
            }
        }

        let worker = self.factory.build(config).await?;
        let worker_id = worker.id().to_string();
        let worker_type = worker.worker_type().to_string();

        let (replaced, pool_size) = {
            let mut workers = self.workers.write().await;
            match workers.iter().position(|w| w.id() == worker_id) {
                Some(pos) => {
                    if !opts.replace_existing {
                        return Err(PoolError::DuplicateWorker { worker_id });
                    }
                    let old = std::mem::replace(&mut workers[pos], worker.clone());
                    (Some(old), workers.len())
                }
                None => {
                    if workers.len() >= self.config.max_workers {
                        return Err(PoolError::AtCapacity {
                            max_workers: self.config.max_workers,
                        });
                    }
                    workers.push(worker.clone());
                    (None, workers.len())
                }
            }
        };

        if let Some(old) = replaced {
            if let Err(err) = old.shutdown().await {
                warn!(worker_id = %old.id(), error = %err, "replaced worker shutdown failed");
            }
            self.events.publish(SwarmEvent::WorkerTerminated {
                worker_id: worker_id.clone(),
                reason: TerminationReason::Replaced,
                pool_size,
                timestamp: Utc::now(),
            });
        }

        info!(worker_id = %worker_id, worker_type = %worker_type, pool_size, "worker spawned");
        self.events.publish(SwarmEvent::WorkerSpawned {
            worker_id,
            worker_type,
            pool_size,
            timestamp: Utc::now(),
        });

        if opts.auto_initialize {
            worker.initialize().await?;
        }
        Ok(worker)
    }

    /// Remove a worker from the pool and shut it down
    pub async fn terminate_worker(
        &self,
        worker_id: &str,
        reason: TerminationReason,
    ) -> PoolResult<()> {
        let (removed, pool_size) = {
            let mut workers = self.workers.write().await;
            let pos = workers
                .iter()
                .position(|w| w.id() == worker_id)
                .ok_or_else(|| PoolError::WorkerNotFound {
                    worker_id: worker_id.to_string(),
                })?;
            let removed = workers.remove(pos);
            (removed, workers.len())
        };

        if let Err(err) = removed.shutdown().await {
            warn!(worker_id, error = %err, "worker shutdown failed during termination");
        }
        info!(worker_id, %reason, pool_size, "worker terminated");
        self.events.publish(SwarmEvent::WorkerTerminated {
            worker_id: worker_id.to_string(),
            reason,
            pool_size,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Score available workers for a task, best first
    ///
    /// Workers at capacity or unable to accept tasks are filtered out before
    /// scoring. The composite blends capability overlap (0.4), embedding
    /// similarity (0.3), inverse load (0.2), and health (0.1), scaled by any
    /// advisory balance weight. Ties keep spawn order. At most `top_k`
    /// candidates come back.
    pub async fn route_task(&self, task: &Task, top_k: usize) -> PoolResult<Vec<RouteCandidate>> {
        let required = infer_required_capabilities(task);
        let embedding = task_embedding(&task.task_type, &task.description);
        let weights = self.weights.read().await.clone();

        let mut candidates = Vec::new();
        {
            let workers = self.workers.read().await;
            for worker in workers.iter() {
                if !worker.status().accepts_tasks() {
                    continue;
                }
                if worker.active_tasks() >= worker.config().max_concurrent_tasks {
                    continue;
                }

                let capability_score = if required.is_empty() {
                    1.0
                } else {
                    let declared = &worker.config().capabilities;
                    let matched = required
                        .iter()
                        .filter(|r| declared.iter().any(|c| c.eq_ignore_ascii_case(r)))
                        .count();
                    matched as f64 / required.len() as f64
                };
                let embedding_score = f64::from(worker.similarity(&embedding).max(0.0));
                let load_score = 1.0 - worker.load();
                let health_score = worker.health().score;

                let mut score = ROUTE_WEIGHT_CAPABILITY * capability_score
                    + ROUTE_WEIGHT_EMBEDDING * embedding_score
                    + ROUTE_WEIGHT_LOAD * load_score
                    + ROUTE_WEIGHT_HEALTH * health_score;
                if let Some(weight) = weights.get(worker.id()) {
                    score *= weight;
                }

                candidates.push(RouteCandidate {
                    worker_id: worker.id().to_string(),
                    score,
                    capability_score,
                    embedding_score,
                    load_score,
                    health_score,
                });
            }
        }

        if let Ok(mut recent) = self.recent_types.lock() {
            if recent.len() >= RECENT_TYPE_WINDOW {
                recent.pop_front();
            }
            recent.push_back(task.task_type.clone());
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(top_k);
        Ok(candidates)
    }

    /// Route a task to the best worker and execute it there
    ///
    /// The routing snapshot can go stale before admission; a worker that
    /// filled up in between rejects at its own door and the error surfaces
    /// here.
    pub async fn execute_task(&self, task: Task) -> PoolResult<TaskOutput> {
        let candidates = self.route_task(&task, 1).await?;
        let top = candidates
            .into_iter()
            .next()
            .ok_or_else(|| PoolError::NoAvailableWorker {
                task_id: task.id.clone(),
            })?;
        let worker =
            self.get_worker(&top.worker_id)
                .await
                .ok_or_else(|| PoolError::WorkerNotFound {
                    worker_id: top.worker_id.clone(),
                })?;

        debug!(
            task_id = %task.id,
            worker_id = %top.worker_id,
            score = top.score,
            "routed task"
        );
        Ok(worker.execute_task(task).await?)
    }

    /// Recompute advisory balance weights for the configured strategy
    ///
    /// Weights are normalized to average 1.0 and only nudge routing scores;
    /// no task is moved or re-queued.
    pub async fn balance_load(&self) -> PoolResult<HashMap<String, f64>> {
        let raw: Vec<(String, f64)> = {
            let workers = self.workers.read().await;
            workers
                .iter()
                .map(|worker| {
                    let weight = match self.config.strategy {
                        LoadBalanceStrategy::RoundRobin => 1.0,
                        LoadBalanceStrategy::LeastLoaded => 0.1 + (1.0 - worker.load()),
                        LoadBalanceStrategy::CapabilityWeighted => {
                            (worker.config().capabilities.len() as f64).max(1.0)
                        }
                    };
                    (worker.id().to_string(), weight)
                })
                .collect()
        };
        if raw.is_empty() {
            return Ok(HashMap::new());
        }

        let sum: f64 = raw.iter().map(|(_, w)| w).sum();
        let count = raw.len() as f64;
        let normalized: HashMap<String, f64> = raw
            .into_iter()
            .map(|(id, w)| (id, w * count / sum))
            .collect();

        *self.weights.write().await = normalized.clone();
        self.events.publish(SwarmEvent::LoadBalanced {
            strategy: self.config.strategy.to_string(),
            workers: normalized.len(),
            timestamp: Utc::now(),
        });
        Ok(normalized)
    }

    /// Most frequent task type over the recent routing window
    fn most_requested_type(&self) -> Option<String> {
        let recent = self.recent_types.lock().ok()?;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for task_type in recent.iter() {
            *counts.entry(task_type.as_str()).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(task_type, _)| task_type.to_string())
    }

    /// Compare average utilization with the thresholds and act once
    ///
    /// Scale-up clones the config of an existing worker of the most
    /// requested recent type (fresh id); scale-down removes the least
    /// loaded worker with nothing in flight.
    pub async fn evaluate_scaling(&self) -> PoolResult<Option<ScaleAction>> {
        let (avg_load, pool_size, scale_down_target) = {
            let workers = self.workers.read().await;
            if workers.is_empty() {
                return Ok(None);
            }
            let avg =
                workers.iter().map(|w| w.load()).sum::<f64>() / workers.len() as f64;
            let target = workers
                .iter()
                .filter(|w| w.active_tasks() == 0)
                .min_by(|a, b| {
                    a.load()
                        .partial_cmp(&b.load())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|w| w.id().to_string());
            (avg, workers.len(), target)
        };

        if avg_load > self.config.scale_up_threshold && pool_size < self.config.max_workers {
            let worker_type = self
                .most_requested_type()
                .unwrap_or_else(|| "general".to_string());
            let template = {
                let workers = self.workers.read().await;
                workers
                    .iter()
                    .find(|w| w.worker_type() == worker_type)
                    .map(|w| w.config().clone())
            };

            let suffix: String = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
            let new_id = format!("{worker_type}-{suffix}");
            let config = match template {
                Some(mut config) => {
                    config.id = new_id.clone();
                    config.name = new_id.clone();
                    config
                }
                None => WorkerConfig::new(new_id.clone(), worker_type.clone())
                    .with_capability(worker_type.clone()),
            };

            let worker = self.spawn_worker(config, SpawnOptions::default()).await?;
            info!(worker_id = %worker.id(), avg_load, "scaled up");
            self.events.publish(SwarmEvent::ScaleUp {
                worker_id: worker.id().to_string(),
                worker_type: worker.worker_type().to_string(),
                utilization: avg_load,
                timestamp: Utc::now(),
            });
            return Ok(Some(ScaleAction::ScaledUp {
                worker_id: worker.id().to_string(),
                worker_type: worker.worker_type().to_string(),
            }));
        }

        if avg_load < self.config.scale_down_threshold && pool_size > self.config.min_workers {
            if let Some(worker_id) = scale_down_target {
                self.terminate_worker(&worker_id, TerminationReason::ScaleDown)
                    .await?;
                info!(worker_id = %worker_id, avg_load, "scaled down");
                self.events.publish(SwarmEvent::ScaleDown {
                    worker_id: worker_id.clone(),
                    utilization: avg_load,
                    timestamp: Utc::now(),
                });
                return Ok(Some(ScaleAction::ScaledDown { worker_id }));
            }
        }

        Ok(None)
    }

    /// Tear down an unhealthy worker and respawn it from its own config
    ///
    /// The replacement keeps the worker's id and slot, so routing order and
    /// external references stay stable.
    async fn recover_worker(&self, worker_id: &str) -> PoolResult<()> {
        let (old, config, pool_size) = {
            let workers = self.workers.read().await;
            let worker = workers
                .iter()
                .find(|w| w.id() == worker_id)
                .ok_or_else(|| PoolError::WorkerNotFound {
                    worker_id: worker_id.to_string(),
                })?;
            (worker.clone(), worker.config().clone(), workers.len())
        };

        if let Err(err) = old.shutdown().await {
            warn!(worker_id, error = %err, "unhealthy worker shutdown failed");
        }
        self.events.publish(SwarmEvent::WorkerTerminated {
            worker_id: worker_id.to_string(),
            reason: TerminationReason::Recovery,
            pool_size,
            timestamp: Utc::now(),
        });

        let replacement = self.factory.build(config).await?;
        replacement.initialize().await?;
        {
            let mut workers = self.workers.write().await;
            match workers.iter().position(|w| w.id() == worker_id) {
                Some(pos) => workers[pos] = replacement,
                None => workers.push(replacement),
            }
        }
        Ok(())
    }

    /// Sweep worker health, recovering any unhealthy worker found
    pub async fn run_health_checks(&self) -> PoolResult<HealthReport> {
        let snapshot = self.workers().await;

        let mut report = HealthReport::default();
        let mut unhealthy = Vec::new();
        for worker in &snapshot {
            let health = worker.health();
            match health.status {
                HealthStatus::Healthy => report.healthy += 1,
                HealthStatus::Degraded => report.degraded += 1,
                HealthStatus::Unhealthy => {
                    report.unhealthy += 1;
                    unhealthy.push((worker.id().to_string(), health.score));
                }
            }
        }

        for (worker_id, score) in unhealthy {
            match self.recover_worker(&worker_id).await {
                Ok(()) => {
                    info!(worker_id = %worker_id, score, "recovered unhealthy worker");
                    self.events.publish(SwarmEvent::WorkerRecovered {
                        worker_id: worker_id.clone(),
                        health_score: score,
                        timestamp: Utc::now(),
                    });
                    report.recovered.push(worker_id);
                }
                Err(err) => {
                    warn!(worker_id = %worker_id, error = %err, "worker recovery failed");
                }
            }
        }

        self.events.publish(SwarmEvent::HealthCheckCompleted {
            healthy: report.healthy,
            degraded: report.degraded,
            unhealthy: report.unhealthy,
            timestamp: Utc::now(),
        });
        Ok(report)
    }

    /// Start the background health and scaling loops
    ///
    /// Safe to call once per pool; repeated calls are ignored.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let pool = Arc::clone(self);
            let token = self.shutdown_token.clone();
            let interval = Duration::from_millis(self.config.health_check_interval_ms);
            self.tracker.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = pool.run_health_checks().await {
                                warn!(error = %err, "health sweep failed");
                            }
                        }
                    }
                }
            });
        }

        {
            let pool = Arc::clone(self);
            let token = self.shutdown_token.clone();
            let interval = Duration::from_millis(self.config.scale_interval_ms);
            self.tracker.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = pool.evaluate_scaling().await {
                                warn!(error = %err, "scaling evaluation failed");
                            }
                        }
                    }
                }
            });
        }

        info!(
            health_interval_ms = self.config.health_check_interval_ms,
            scale_interval_ms = self.config.scale_interval_ms,
            "pool background loops started"
        );
    }

    /// Stop the background loops and shut every worker down
    pub async fn shutdown(&self) -> PoolResult<()> {
        self.shutdown_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let drained: Vec<SharedWorker> = {
            let mut workers = self.workers.write().await;
            workers.drain(..).collect()
        };
        let results = join_all(drained.iter().map(|w| w.shutdown())).await;
        for (worker, result) in drained.iter().zip(results) {
            if let Err(err) = result {
                warn!(worker_id = %worker.id(), error = %err, "worker shutdown failed");
            }
            self.events.publish(SwarmEvent::WorkerTerminated {
                worker_id: worker.id().to_string(),
                reason: TerminationReason::Shutdown,
                pool_size: 0,
                timestamp: Utc::now(),
            });
        }

        info!(workers = drained.len(), "pool shut down");
        Ok(())
    }

    /// Aggregate statistics over all registered workers
    pub async fn stats(&self) -> PoolStats {
        let workers = self.workers.read().await;
        let mut stats = PoolStats {
            total_workers: workers.len(),
            ..PoolStats::default()
        };

        let mut load_sum = 0.0;
        let mut health_sum = 0.0;
        for worker in workers.iter() {
            let status = worker.status();
            match status {
                WorkerStatus::Idle => stats.idle_workers += 1,
                WorkerStatus::Busy => stats.busy_workers += 1,
                _ => {}
            }
            *stats
                .workers_by_type
                .entry(worker.worker_type().to_string())
                .or_default() += 1;
            *stats
                .workers_by_status
                .entry(status.to_string())
                .or_default() += 1;
            stats.total_active_tasks += worker.active_tasks();
            let metrics = worker.metrics();
            stats.total_tasks_executed += metrics.tasks_executed;
            stats.total_tasks_succeeded += metrics.tasks_succeeded;
            stats.total_tasks_failed += metrics.tasks_failed;
            load_sum += worker.load();
            health_sum += worker.health().score;
        }

        if stats.total_workers > 0 {
            stats.avg_load = load_sum / stats.total_workers as f64;
            stats.avg_health_score = health_sum / stats.total_workers as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::worker::{ExecutionContext, TaskExecutor, WorkerResult};
    use serde_json::json;
    use tokio::sync::Notify;

    fn pool_with(config: PoolConfig) -> WorkerPool {
        WorkerPool::new(config, EventBus::new().shared()).unwrap()
    }

    fn worker_config(id: &str, worker_type: &str, caps: &[&str]) -> WorkerConfig {
        WorkerConfig::new(id, worker_type)
            .with_capabilities(caps.iter().map(|c| c.to_string()).collect())
    }

    /// Executor that parks every task until the shared gate opens
    struct GatedExecutor {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl TaskExecutor for GatedExecutor {
        async fn execute(
            &self,
            task: &Task,
            ctx: &ExecutionContext,
        ) -> WorkerResult<TaskOutput> {
            self.gate.notified().await;
            Ok(TaskOutput::succeeded(&task.id, &ctx.worker_id, None))
        }
    }

    fn gated_factory(gate: Arc<Notify>, events: SharedEventBus) -> Arc<dyn WorkerFactory> {
        Arc::new(move |config: WorkerConfig| -> PoolResult<SharedWorker> {
            let worker = WorkerBase::new(
                config,
                Arc::new(GatedExecutor { gate: gate.clone() }),
                events.clone(),
            )?;
            Ok(Arc::new(worker) as SharedWorker)
        })
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());

        let mut bad = PoolConfig::default();
        bad.min_workers = 20;
        assert!(bad.validate().is_err());

        let mut bad = PoolConfig::default();
        bad.scale_down_threshold = 0.9;
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_spawn_duplicate_and_replace() {
        let pool = pool_with(PoolConfig::default());
        pool.spawn_worker(worker_config("w-1", "general", &[]), SpawnOptions::default())
            .await
            .unwrap();

        let err = pool
            .spawn_worker(worker_config("w-1", "general", &[]), SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::DuplicateWorker { .. }));

        let replacement = pool
            .spawn_worker(
                worker_config("w-1", "general", &["rust"]),
                SpawnOptions::default().replace(),
            )
            .await
            .unwrap();
        assert_eq!(pool.len().await, 1);
        assert_eq!(replacement.config().capabilities, vec!["rust".to_string()]);
    }

    #[tokio::test]
    async fn test_pool_capacity_limit() {
        let pool = pool_with(PoolConfig {
            max_workers: 2,
            ..PoolConfig::default()
        });
        pool.spawn_worker(worker_config("w-1", "general", &[]), SpawnOptions::default())
            .await
            .unwrap();
        pool.spawn_worker(worker_config("w-2", "general", &[]), SpawnOptions::default())
            .await
            .unwrap();

        let err = pool
            .spawn_worker(worker_config("w-3", "general", &[]), SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::AtCapacity { .. }));
    }

    #[tokio::test]
    async fn test_route_prefers_capability_match() {
        let pool = pool_with(PoolConfig::default());
        pool.spawn_worker(
            worker_config("w-py", "python", &["python"]),
            SpawnOptions::default(),
        )
        .await
        .unwrap();
        pool.spawn_worker(
            worker_config(
                "w-ts",
                "typescript",
                &["typescript", "testing", "test-generation"],
            ),
            SpawnOptions::default(),
        )
        .await
        .unwrap();
        pool.spawn_worker(
            worker_config("w-docs", "documentation", &["documentation"]),
            SpawnOptions::default(),
        )
        .await
        .unwrap();

        let task = Task::new("t-1", "testing", "write typescript unit tests");
        let candidates = pool.route_task(&task, 3).await.unwrap();

        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].worker_id, "w-ts");
        for pair in candidates.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }

        let top_two = pool.route_task(&task, 2).await.unwrap();
        assert_eq!(top_two.len(), 2);
    }

    #[tokio::test]
    async fn test_route_skips_unavailable_workers() {
        let events = EventBus::new().shared();
        let gate = Arc::new(Notify::new());
        let pool = WorkerPool::with_factory(
            PoolConfig::default(),
            gated_factory(gate.clone(), events.clone()),
            events,
        )
        .unwrap();

        let busy = pool
            .spawn_worker(
                worker_config("w-busy", "general", &[]).with_max_concurrent_tasks(1),
                SpawnOptions::default(),
            )
            .await
            .unwrap();
        pool.spawn_worker(
            worker_config("w-free", "general", &[]),
            SpawnOptions::default(),
        )
        .await
        .unwrap();
        // Registered but never initialized: still spawning, not routable.
        pool.spawn_worker(
            worker_config("w-raw", "general", &[]),
            SpawnOptions::default().without_initialize(),
        )
        .await
        .unwrap();

        let runner = busy.clone();
        let handle =
            tokio::spawn(async move { runner.execute_task(Task::new("t-0", "general", "hold")).await });
        while busy.active_tasks() == 0 {
            tokio::task::yield_now().await;
        }

        let candidates = pool
            .route_task(&Task::new("t-1", "general", "quick job"), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = candidates.iter().map(|c| c.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["w-free"]);

        gate.notify_one();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_task_routes_and_runs() {
        let pool = pool_with(PoolConfig::default());
        pool.spawn_worker(
            worker_config("w-1", "testing", &["testing", "test-generation"]),
            SpawnOptions::default(),
        )
        .await
        .unwrap();

        let output = pool
            .execute_task(Task::new("t-1", "testing", "run the suite"))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.worker_id, "w-1");

        let stats = pool.stats().await;
        assert_eq!(stats.total_tasks_executed, 1);
        assert_eq!(stats.total_tasks_succeeded, 1);
        assert_eq!(stats.workers_by_type.get("testing"), Some(&1));
        assert_eq!(stats.workers_by_status.get("idle"), Some(&1));
    }

    #[tokio::test]
    async fn test_execute_with_no_workers_fails() {
        let pool = pool_with(PoolConfig::default());
        let err = pool
            .execute_task(Task::new("t-1", "testing", "nobody home"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NoAvailableWorker { .. }));
    }

    #[tokio::test]
    async fn test_balance_weights_normalized() {
        let pool = pool_with(PoolConfig::default());
        for id in ["w-1", "w-2", "w-3"] {
            pool.spawn_worker(worker_config(id, "general", &[]), SpawnOptions::default())
                .await
                .unwrap();
        }

        let mut rx = pool.events().subscribe();
        let weights = pool.balance_load().await.unwrap();
        assert_eq!(weights.len(), 3);
        let avg: f64 = weights.values().sum::<f64>() / weights.len() as f64;
        assert!((avg - 1.0).abs() < 1e-9);

        let mut saw_balanced = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SwarmEvent::LoadBalanced { .. }) {
                saw_balanced = true;
            }
        }
        assert!(saw_balanced);
    }

    #[tokio::test]
    async fn test_scaling_up_then_down() {
        let events = EventBus::new().shared();
        let gate = Arc::new(Notify::new());
        let pool = WorkerPool::with_factory(
            PoolConfig {
                min_workers: 1,
                max_workers: 3,
                ..PoolConfig::default()
            },
            gated_factory(gate.clone(), events.clone()),
            events,
        )
        .unwrap();

        let busy = pool
            .spawn_worker(
                worker_config("ts-0", "typescript", &["typescript"]).with_max_concurrent_tasks(1),
                SpawnOptions::default(),
            )
            .await
            .unwrap();

        // Record demand for the typescript type, then saturate the worker.
        pool.route_task(&Task::new("t-route", "typescript", "compile"), 1)
            .await
            .unwrap();
        let runner = busy.clone();
        let handle = tokio::spawn(async move {
            runner
                .execute_task(Task::new("t-hold", "typescript", "hold the slot"))
                .await
        });
        while busy.active_tasks() == 0 {
            tokio::task::yield_now().await;
        }

        let action = pool.evaluate_scaling().await.unwrap().unwrap();
        match &action {
            ScaleAction::ScaledUp { worker_type, .. } => {
                assert_eq!(worker_type, "typescript");
            }
            other => panic!("expected scale-up, got {other:?}"),
        }
        assert_eq!(pool.len().await, 2);

        // The clone inherited the template's concurrency ceiling.
        if let ScaleAction::ScaledUp { worker_id, .. } = &action {
            let spawned = pool.get_worker(worker_id).await.unwrap();
            assert_eq!(spawned.config().max_concurrent_tasks, 1);
        }

        gate.notify_one();
        handle.await.unwrap().unwrap();

        // Pool is now idle and above the floor: one worker goes.
        let action = pool.evaluate_scaling().await.unwrap().unwrap();
        assert!(matches!(action, ScaleAction::ScaledDown { .. }));
        assert_eq!(pool.len().await, 1);

        // At the floor nothing more comes off.
        assert!(pool.evaluate_scaling().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_sweep_recovers_unhealthy_worker() {
        let pool = pool_with(PoolConfig::default());
        let worker = pool
            .spawn_worker(
                worker_config("w-sick", "general", &[]),
                SpawnOptions::default(),
            )
            .await
            .unwrap();

        for i in 0..4 {
            let task = Task::new(format!("t-{i}"), "general", "doomed")
                .with_input(json!({"fail_with": "boom"}));
            let output = worker.execute_task(task).await.unwrap();
            assert!(!output.success);
        }
        assert_eq!(worker.health().status, HealthStatus::Unhealthy);

        let mut rx = pool.events().subscribe();
        let report = pool.run_health_checks().await.unwrap();
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.recovered, vec!["w-sick".to_string()]);

        // Same id, fresh worker: metrics start over and it is routable again.
        let replacement = pool.get_worker("w-sick").await.unwrap();
        assert_eq!(replacement.metrics().tasks_executed, 0);
        assert_eq!(replacement.status(), WorkerStatus::Idle);

        let mut saw_recovered = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SwarmEvent::WorkerRecovered { .. }) {
                saw_recovered = true;
            }
        }
        assert!(saw_recovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loops_and_shutdown() {
        let pool = pool_with(PoolConfig {
            health_check_interval_ms: 1_000,
            scale_interval_ms: 600_000,
            ..PoolConfig::default()
        })
        .shared();
        pool.spawn_worker(
            worker_config("w-1", "general", &[]),
            SpawnOptions::default(),
        )
        .await
        .unwrap();

        let mut rx = pool.events().subscribe();
        pool.start();
        pool.start(); // second call is a no-op

        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let mut sweeps = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SwarmEvent::HealthCheckCompleted { .. }) {
                sweeps += 1;
            }
        }
        assert!(sweeps >= 2, "expected periodic sweeps, saw {sweeps}");

        let mut rx = pool.events().subscribe();
        pool.shutdown().await.unwrap();
        assert!(pool.is_empty().await);

        let mut saw_termination = false;
        while let Ok(event) = rx.try_recv() {
            if let SwarmEvent::WorkerTerminated { reason, .. } = event {
                assert_eq!(reason, TerminationReason::Shutdown);
                saw_termination = true;
            }
        }
        assert!(saw_termination);
    }

    #[tokio::test]
    async fn test_terminate_unknown_worker() {
        let pool = pool_with(PoolConfig::default());
        let err = pool
            .terminate_worker("ghost", TerminationReason::Shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::WorkerNotFound { .. }));
    }
}
