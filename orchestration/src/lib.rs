//! Swarm Pool Library
//!
//! This library provides:
//! - A worker abstraction with lifecycle, load, and health tracking
//! - Specialized workers that score task/worker fit before executing
//! - Long-running workers with checkpoints, retries, timeouts, and resume
//! - A self-healing pool with routing, balancing, and auto-scaling
//!
//! # Architecture
//!
//! ```text
//!                 +--------------------+
//!    Task ------> |     WorkerPool     | ----> SwarmEvent bus
//!                 |  route / balance   |
//!                 |  scale / recover   |
//!                 +---------+----------+
//!                           |
//!            +--------------+--------------+
//!            |              |              |
//!     +------v-----+ +------v------+ +-----v-------+
//!     | WorkerBase | | Specialized | | LongRunning |
//!     |  (admission| |   Worker    | |   Worker    |
//!     |  + metrics)| | (fit score) | | (checkpoint)|
//!     +------------+ +-------------+ +-------------+
//! ```
//!
//! Every worker wraps a [`worker::WorkerBase`], which owns admission control
//! (concurrency ceiling), load accounting, metrics, and health scoring. The
//! actual work is behind the [`worker::TaskExecutor`] seam so hosts plug in
//! real integrations; a simulated executor ships for development and tests.
//! All components publish structured [`events::SwarmEvent`]s on a broadcast
//! bus instead of holding callbacks.

pub mod embedding;
pub mod events;
pub mod pool;
pub mod task;
pub mod worker;

// Re-export key task types
pub use task::{estimate_tokens, Task, TaskArtifact, TaskId, TaskOutput, TaskPriority, WorkerId};

// Re-export key worker types
pub use worker::base::WorkerBase;
pub use worker::{
    CancelSignal, ExecutionContext, ExecutionPhase, HealthStatus, ProgressSink, SharedTaskExecutor,
    SharedWorker, SimulatedExecutor, TaskExecutor, Worker, WorkerConfig, WorkerError,
    WorkerHealth, WorkerMessage, WorkerMetrics, WorkerResult, WorkerStatus,
};

// Re-export specialized worker types
pub use worker::specialized::{
    infer_required_capabilities, DomainProcessor, SpecializationProfile, SpecializedWorker,
    TaskMatch,
};

// Re-export long-running worker and checkpoint types
pub use worker::checkpoint::{
    Checkpoint, CheckpointError, CheckpointResult, CheckpointState, CheckpointStore,
    FileCheckpointStore, MemoryCheckpointStore, SharedCheckpointStore,
};
pub use worker::long_running::{
    DefaultStagedExecutor, LongRunningConfig, LongRunningWorker, SharedStagedExecutor,
    StagedExecutor,
};

// Re-export key pool types
pub use pool::{
    DefaultWorkerFactory, HealthReport, LoadBalanceStrategy, PoolConfig, PoolError, PoolResult,
    PoolStats, RouteCandidate, ScaleAction, SharedWorkerPool, SpawnOptions, WorkerFactory,
    WorkerPool,
};

// Re-export key event types
pub use events::{
    EventBus, EventBusExt, EventFilter, FilteredReceiver, SharedEventBus, SwarmEvent,
    TerminationReason,
};

// Re-export embedding helpers
pub use embedding::{capability_embedding, cosine_similarity, task_embedding, EMBEDDING_DIM};
