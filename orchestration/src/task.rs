//! Core task types for the worker pool
//!
//! Tasks are immutable once submitted: a caller constructs a [`Task`], hands it
//! to a worker (directly or through the pool router), and receives a
//! [`TaskOutput`] describing what happened. Exactly one worker consumes a task
//! at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Unique identifier for tasks
pub type TaskId = String;

/// Unique identifier for workers
pub type WorkerId = String;

/// Priority attached to a task at submission time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background work, deferrable
    Low,
    /// Default priority
    Normal,
    /// Should jump ahead of normal work
    High,
    /// Latency-sensitive, schedule first
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

/// A unit of work routed to exactly one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier (required, must be non-empty)
    pub id: TaskId,

    /// Type tag used for capability inference and routing
    pub task_type: String,

    /// Free-text description of the work
    pub description: String,

    /// Optional structured input for the executor
    pub input: Option<Value>,

    /// Scheduling priority
    pub priority: TaskPriority,

    /// Optional per-task timeout override in milliseconds
    pub timeout_ms: Option<u64>,

    /// Arbitrary metadata (e.g. a `domain` hint for specialized workers)
    pub metadata: HashMap<String, Value>,

    /// Submission timestamp
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task with the given identity, type tag, and description
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            description: description.into(),
            input: None,
            priority: TaskPriority::default(),
            timeout_ms: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach structured input
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Set the scheduling priority
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a per-task timeout in milliseconds
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Read a string-valued metadata entry
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Read an integer input field, if structured input is present
    pub fn input_u64(&self, key: &str) -> Option<u64> {
        self.input
            .as_ref()
            .and_then(|v| v.get(key))
            .and_then(Value::as_u64)
    }

    /// Read a string input field, if structured input is present
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input
            .as_ref()
            .and_then(|v| v.get(key))
            .and_then(Value::as_str)
    }
}

/// An artifact produced by task execution (report, patch, rendered output)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskArtifact {
    /// Unique artifact identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Artifact kind tag (e.g. `summary`, `report`, `diff`)
    pub kind: String,

    /// Artifact payload
    pub data: Value,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl TaskArtifact {
    /// Create a new artifact with a generated id
    pub fn new(name: impl Into<String>, kind: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind: kind.into(),
            data,
            created_at: Utc::now(),
        }
    }
}

/// Structured result of a single task execution
///
/// Execution failures are reported here with `success == false`; workers never
/// surface them as call-site errors once a task has been admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Task this output belongs to
    pub task_id: TaskId,

    /// Worker that executed the task
    pub worker_id: WorkerId,

    /// Whether execution succeeded
    pub success: bool,

    /// Result payload on success
    pub result: Option<Value>,

    /// Error description on failure
    pub error: Option<String>,

    /// Wall-clock execution duration in milliseconds
    pub duration_ms: u64,

    /// Tokens consumed by the execution
    pub tokens_used: u64,

    /// Artifacts produced during execution
    pub artifacts: Vec<TaskArtifact>,

    /// Extra execution metadata (e.g. `checkpoint_id`, `attempts`)
    pub metadata: HashMap<String, Value>,

    /// Completion timestamp
    pub completed_at: DateTime<Utc>,
}

impl TaskOutput {
    /// Build a successful output
    pub fn succeeded(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        result: Option<Value>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            success: true,
            result,
            error: None,
            duration_ms: 0,
            tokens_used: 0,
            artifacts: Vec::new(),
            metadata: HashMap::new(),
            completed_at: Utc::now(),
        }
    }

    /// Build a failed output
    pub fn failed(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            duration_ms: 0,
            tokens_used: 0,
            artifacts: Vec::new(),
            metadata: HashMap::new(),
            completed_at: Utc::now(),
        }
    }

    /// Set the measured duration
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Set the token count
    pub fn with_tokens_used(mut self, tokens_used: u64) -> Self {
        self.tokens_used = tokens_used;
        self
    }

    /// Append an artifact
    pub fn with_artifact(mut self, artifact: TaskArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Read a string-valued metadata entry
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Rough token estimate for free text (4 characters per token)
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_builders() {
        let task = Task::new("t-1", "code-generation", "Generate a parser")
            .with_priority(TaskPriority::High)
            .with_timeout_ms(5_000)
            .with_input(json!({"total_steps": 3}))
            .with_metadata("domain", json!("backend"));

        assert_eq!(task.id, "t-1");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.timeout_ms, Some(5_000));
        assert_eq!(task.input_u64("total_steps"), Some(3));
        assert_eq!(task.metadata_str("domain"), Some("backend"));
    }

    #[test]
    fn test_output_success_and_failure() {
        let ok = TaskOutput::succeeded("t-1", "w-1", Some(json!({"lines": 42})))
            .with_duration_ms(120)
            .with_tokens_used(64);
        assert!(ok.success);
        assert!(ok.error.is_none());
        assert_eq!(ok.duration_ms, 120);

        let failed = TaskOutput::failed("t-1", "w-1", "executor exploded");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("executor exploded"));
        assert!(failed.result.is_none());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn test_task_serde_round_trip() {
        let task = Task::new("t-2", "testing", "run the suite").with_priority(TaskPriority::Low);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.priority, TaskPriority::Low);
    }
}
