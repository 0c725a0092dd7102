//! Typed events emitted by workers and the pool
//!
//! Every observable state change in the worker subsystem is a variant here, so
//! diagnostics are part of the typed contract rather than a stringly-named
//! side channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a worker left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Pool-wide shutdown
    Shutdown,
    /// Auto-scaler removed an underutilized worker
    ScaleDown,
    /// Worker was torn down for health recovery
    Recovery,
    /// Worker was replaced by a spawn with the same id
    Replaced,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Shutdown => write!(f, "shutdown"),
            TerminationReason::ScaleDown => write!(f, "scale_down"),
            TerminationReason::Recovery => write!(f, "recovery"),
            TerminationReason::Replaced => write!(f, "replaced"),
        }
    }
}

/// Events published on the worker/pool event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmEvent {
    /// A worker object was constructed
    WorkerCreated {
        worker_id: String,
        worker_type: String,
        timestamp: DateTime<Utc>,
    },

    /// Worker initialization started
    WorkerInitializing {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Worker initialization finished; the worker is idle
    WorkerInitialized {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A task was admitted for execution
    TaskStarted {
        worker_id: String,
        task_id: String,
        task_type: String,
        timestamp: DateTime<Utc>,
    },

    /// A task finished successfully
    TaskCompleted {
        worker_id: String,
        task_id: String,
        duration_ms: u64,
        tokens_used: u64,
        timestamp: DateTime<Utc>,
    },

    /// A task finished with a failure
    TaskFailed {
        worker_id: String,
        task_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A worker shut down
    WorkerShutdown {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The pool registered a new worker
    WorkerSpawned {
        worker_id: String,
        worker_type: String,
        pool_size: usize,
        timestamp: DateTime<Utc>,
    },

    /// The pool removed a worker
    WorkerTerminated {
        worker_id: String,
        reason: TerminationReason,
        pool_size: usize,
        timestamp: DateTime<Utc>,
    },

    /// An unhealthy worker was torn down and respawned with its config
    WorkerRecovered {
        worker_id: String,
        health_score: f64,
        timestamp: DateTime<Utc>,
    },

    /// A pool-wide health sweep finished
    HealthCheckCompleted {
        healthy: usize,
        degraded: usize,
        unhealthy: usize,
        timestamp: DateTime<Utc>,
    },

    /// The auto-scaler added a worker
    ScaleUp {
        worker_id: String,
        worker_type: String,
        utilization: f64,
        timestamp: DateTime<Utc>,
    },

    /// The auto-scaler removed a worker
    ScaleDown {
        worker_id: String,
        utilization: f64,
        timestamp: DateTime<Utc>,
    },

    /// Advisory routing weights were recomputed
    LoadBalanced {
        strategy: String,
        workers: usize,
        timestamp: DateTime<Utc>,
    },

    /// A long-running worker persisted a checkpoint
    CheckpointSaved {
        worker_id: String,
        task_id: String,
        checkpoint_id: String,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },

    /// A timer-driven checkpoint save failed (the task keeps running)
    CheckpointError {
        worker_id: String,
        task_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Progress report from a long-running execution
    Progress {
        worker_id: String,
        task_id: String,
        progress: f64,
        eta_ms: Option<u64>,
        timestamp: DateTime<Utc>,
    },
}

impl SwarmEvent {
    /// Get the event timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SwarmEvent::WorkerCreated { timestamp, .. }
            | SwarmEvent::WorkerInitializing { timestamp, .. }
            | SwarmEvent::WorkerInitialized { timestamp, .. }
            | SwarmEvent::TaskStarted { timestamp, .. }
            | SwarmEvent::TaskCompleted { timestamp, .. }
            | SwarmEvent::TaskFailed { timestamp, .. }
            | SwarmEvent::WorkerShutdown { timestamp, .. }
            | SwarmEvent::WorkerSpawned { timestamp, .. }
            | SwarmEvent::WorkerTerminated { timestamp, .. }
            | SwarmEvent::WorkerRecovered { timestamp, .. }
            | SwarmEvent::HealthCheckCompleted { timestamp, .. }
            | SwarmEvent::ScaleUp { timestamp, .. }
            | SwarmEvent::ScaleDown { timestamp, .. }
            | SwarmEvent::LoadBalanced { timestamp, .. }
            | SwarmEvent::CheckpointSaved { timestamp, .. }
            | SwarmEvent::CheckpointError { timestamp, .. }
            | SwarmEvent::Progress { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string for logging and filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            SwarmEvent::WorkerCreated { .. } => "worker_created",
            SwarmEvent::WorkerInitializing { .. } => "worker_initializing",
            SwarmEvent::WorkerInitialized { .. } => "worker_initialized",
            SwarmEvent::TaskStarted { .. } => "task_started",
            SwarmEvent::TaskCompleted { .. } => "task_completed",
            SwarmEvent::TaskFailed { .. } => "task_failed",
            SwarmEvent::WorkerShutdown { .. } => "worker_shutdown",
            SwarmEvent::WorkerSpawned { .. } => "worker_spawned",
            SwarmEvent::WorkerTerminated { .. } => "worker_terminated",
            SwarmEvent::WorkerRecovered { .. } => "worker_recovered",
            SwarmEvent::HealthCheckCompleted { .. } => "health_check_completed",
            SwarmEvent::ScaleUp { .. } => "scale_up",
            SwarmEvent::ScaleDown { .. } => "scale_down",
            SwarmEvent::LoadBalanced { .. } => "load_balanced",
            SwarmEvent::CheckpointSaved { .. } => "checkpoint_saved",
            SwarmEvent::CheckpointError { .. } => "checkpoint_error",
            SwarmEvent::Progress { .. } => "progress",
        }
    }

    /// Get the worker id if this event concerns a specific worker
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            SwarmEvent::WorkerCreated { worker_id, .. }
            | SwarmEvent::WorkerInitializing { worker_id, .. }
            | SwarmEvent::WorkerInitialized { worker_id, .. }
            | SwarmEvent::TaskStarted { worker_id, .. }
            | SwarmEvent::TaskCompleted { worker_id, .. }
            | SwarmEvent::TaskFailed { worker_id, .. }
            | SwarmEvent::WorkerShutdown { worker_id, .. }
            | SwarmEvent::WorkerSpawned { worker_id, .. }
            | SwarmEvent::WorkerTerminated { worker_id, .. }
            | SwarmEvent::WorkerRecovered { worker_id, .. }
            | SwarmEvent::ScaleUp { worker_id, .. }
            | SwarmEvent::ScaleDown { worker_id, .. }
            | SwarmEvent::CheckpointSaved { worker_id, .. }
            | SwarmEvent::CheckpointError { worker_id, .. }
            | SwarmEvent::Progress { worker_id, .. } => Some(worker_id),
            SwarmEvent::HealthCheckCompleted { .. } | SwarmEvent::LoadBalanced { .. } => None,
        }
    }

    /// Get the task id if this event concerns a specific task
    pub fn task_id(&self) -> Option<&str> {
        match self {
            SwarmEvent::TaskStarted { task_id, .. }
            | SwarmEvent::TaskCompleted { task_id, .. }
            | SwarmEvent::TaskFailed { task_id, .. }
            | SwarmEvent::CheckpointSaved { task_id, .. }
            | SwarmEvent::CheckpointError { task_id, .. }
            | SwarmEvent::Progress { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_accessors() {
        let event = SwarmEvent::TaskStarted {
            worker_id: "w-1".to_string(),
            task_id: "t-1".to_string(),
            task_type: "testing".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "task_started");
        assert_eq!(event.worker_id(), Some("w-1"));
        assert_eq!(event.task_id(), Some("t-1"));

        let sweep = SwarmEvent::HealthCheckCompleted {
            healthy: 2,
            degraded: 1,
            unhealthy: 0,
            timestamp: Utc::now(),
        };
        assert_eq!(sweep.worker_id(), None);
        assert_eq!(sweep.task_id(), None);
    }

    #[test]
    fn test_event_serialization_tags() {
        let event = SwarmEvent::ScaleUp {
            worker_id: "w-9".to_string(),
            worker_type: "general".to_string(),
            utilization: 0.92,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"scale_up\""));
    }
}
