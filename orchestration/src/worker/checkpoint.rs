//! Checkpoint model and persistence for long-running tasks
//!
//! A [`Checkpoint`] freezes the resumable state of one task on one worker:
//! execution phase, step position, partial results, context, and artifacts.
//! Sequence numbers increase strictly per (task, worker) pair, so the latest
//! checkpoint is always the one with the highest sequence.
//!
//! Persistence sits behind [`CheckpointStore`]; the in-memory store backs
//! tests and single-process runs, the file store survives restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::task::TaskArtifact;

use super::ExecutionPhase;

/// Error type for checkpoint operations
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint {id} not found")]
    NotFound { id: String },

    #[error("checkpoint storage failed: {reason}")]
    Storage { reason: String },

    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint io failed: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Create a storage error
    pub fn storage(reason: impl Into<String>) -> Self {
        CheckpointError::Storage {
            reason: reason.into(),
        }
    }
}

/// Result type for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Resumable execution state frozen into a checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Phase the execution was in
    pub phase: ExecutionPhase,
    /// Last completed processing step (0 before the first step)
    pub step: usize,
    /// Total processing steps planned for the run
    pub total_steps: usize,
    /// Partial results accumulated so far
    pub partial_results: Vec<Value>,
    /// Executor context carried across resume
    pub context: HashMap<String, Value>,
    /// Artifacts produced so far
    pub artifacts: Vec<TaskArtifact>,
}

/// A persisted snapshot of one task's progress on one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint identifier
    pub id: String,
    /// Task the snapshot belongs to
    pub task_id: String,
    /// Worker that produced the snapshot
    pub worker_id: String,
    /// Strictly increasing per (task, worker)
    pub sequence: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Frozen execution state
    pub state: CheckpointState,
    /// Overall progress estimate in [0, 1] at save time
    pub progress: f64,
    /// Extra metadata (task type and description ride along for resume)
    pub metadata: HashMap<String, Value>,
}

impl Checkpoint {
    /// Create a checkpoint with a generated id
    pub fn new(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        sequence: u64,
        state: CheckpointState,
        progress: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            sequence,
            created_at: Utc::now(),
            state,
            progress,
            metadata: HashMap::new(),
        }
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

/// Persistence seam for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint
    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()>;

    /// Load a checkpoint by id
    async fn load(&self, id: &str) -> CheckpointResult<Checkpoint>;

    /// Load the highest-sequence checkpoint for a (task, worker) pair
    async fn load_latest(
        &self,
        task_id: &str,
        worker_id: &str,
    ) -> CheckpointResult<Option<Checkpoint>>;

    /// List checkpoints for a (task, worker) pair in ascending sequence order
    async fn list(&self, task_id: &str, worker_id: &str) -> CheckpointResult<Vec<Checkpoint>>;

    /// Delete a checkpoint by id; deleting an absent id is not an error
    async fn delete(&self, id: &str) -> CheckpointResult<()>;

    /// Delete every checkpoint belonging to a task, returning how many went
    async fn delete_all(&self, task_id: &str) -> CheckpointResult<usize>;
}

/// Shared reference to a checkpoint store
pub type SharedCheckpointStore = std::sync::Arc<dyn CheckpointStore>;

/// In-memory checkpoint store for tests and single-process runs
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints
    pub fn len(&self) -> usize {
        self.checkpoints.read().map(|map| map.len()).unwrap_or(0)
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let mut map = self
            .checkpoints
            .write()
            .map_err(|_| CheckpointError::storage("checkpoint map lock poisoned"))?;
        map.insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> CheckpointResult<Checkpoint> {
        let map = self
            .checkpoints
            .read()
            .map_err(|_| CheckpointError::storage("checkpoint map lock poisoned"))?;
        map.get(id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound { id: id.to_string() })
    }

    async fn load_latest(
        &self,
        task_id: &str,
        worker_id: &str,
    ) -> CheckpointResult<Option<Checkpoint>> {
        let map = self
            .checkpoints
            .read()
            .map_err(|_| CheckpointError::storage("checkpoint map lock poisoned"))?;
        Ok(map
            .values()
            .filter(|cp| cp.task_id == task_id && cp.worker_id == worker_id)
            .max_by_key(|cp| cp.sequence)
            .cloned())
    }

    async fn list(&self, task_id: &str, worker_id: &str) -> CheckpointResult<Vec<Checkpoint>> {
        let map = self
            .checkpoints
            .read()
            .map_err(|_| CheckpointError::storage("checkpoint map lock poisoned"))?;
        let mut matching: Vec<Checkpoint> = map
            .values()
            .filter(|cp| cp.task_id == task_id && cp.worker_id == worker_id)
            .cloned()
            .collect();
        matching.sort_by_key(|cp| cp.sequence);
        Ok(matching)
    }

    async fn delete(&self, id: &str) -> CheckpointResult<()> {
        let mut map = self
            .checkpoints
            .write()
            .map_err(|_| CheckpointError::storage("checkpoint map lock poisoned"))?;
        map.remove(id);
        Ok(())
    }

    async fn delete_all(&self, task_id: &str) -> CheckpointResult<usize> {
        let mut map = self
            .checkpoints
            .write()
            .map_err(|_| CheckpointError::storage("checkpoint map lock poisoned"))?;
        let before = map.len();
        map.retain(|_, cp| cp.task_id != task_id);
        Ok(before - map.len())
    }
}

/// File-backed checkpoint store, one JSON document per checkpoint
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at the given directory
    ///
    /// The directory is created lazily on the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read_all(&self) -> CheckpointResult<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Checkpoint>(&raw) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable checkpoint");
                }
            }
        }
        Ok(checkpoints)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(self.path_for(&checkpoint.id), raw).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> CheckpointResult<Checkpoint> {
        let raw = match tokio::fs::read_to_string(self.path_for(id)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound { id: id.to_string() })
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    async fn load_latest(
        &self,
        task_id: &str,
        worker_id: &str,
    ) -> CheckpointResult<Option<Checkpoint>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|cp| cp.task_id == task_id && cp.worker_id == worker_id)
            .max_by_key(|cp| cp.sequence))
    }

    async fn list(&self, task_id: &str, worker_id: &str) -> CheckpointResult<Vec<Checkpoint>> {
        let mut matching: Vec<Checkpoint> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|cp| cp.task_id == task_id && cp.worker_id == worker_id)
            .collect();
        matching.sort_by_key(|cp| cp.sequence);
        Ok(matching)
    }

    async fn delete(&self, id: &str) -> CheckpointResult<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_all(&self, task_id: &str) -> CheckpointResult<usize> {
        let mut deleted = 0usize;
        for checkpoint in self.read_all().await? {
            if checkpoint.task_id == task_id {
                self.delete(&checkpoint.id).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
