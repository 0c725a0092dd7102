//! Execution seam between routing decisions and actual model calls
//!
//! The router and adapter never talk to a provider SDK directly; they hand a
//! [`BackendRequest`] to an injected [`ModelBackend`]. The default
//! [`SimulatedBackend`] stands in for the network during development and
//! tests, sleeping out the model's nominal latency and synthesizing token
//! counts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for backend calls
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend call to {model_id} failed: {reason}")]
    Call { model_id: String, reason: String },

    #[error("backend call to {model_id} timed out after {timeout_ms}ms")]
    Timeout { model_id: String, timeout_ms: u64 },
}

impl BackendError {
    /// Create a call failure
    pub fn call(model_id: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Call {
            model_id: model_id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for backend calls
pub type BackendResult<T> = Result<T, BackendError>;

/// One completion call, already resolved to a concrete model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRequest {
    /// Provider identifier, for logging and fault attribution
    pub provider_id: String,
    /// Concrete model to call
    pub model_id: String,
    /// Prompt text
    pub prompt: String,
    /// Output token ceiling
    pub max_tokens: u32,
    /// Latency the simulated backend should exhibit
    pub nominal_latency_ms: u64,
}

/// What came back from the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Generated text
    pub content: String,
    /// Tokens consumed by the prompt
    pub input_tokens: u64,
    /// Tokens generated
    pub output_tokens: u64,
    /// Observed round-trip latency
    pub latency_ms: u64,
}

/// Pluggable completion transport
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Execute one completion call
    async fn complete(&self, request: &BackendRequest) -> BackendResult<BackendResponse>;
}

/// Shared reference to a model backend
pub type SharedModelBackend = Arc<dyn ModelBackend>;

/// Backend that simulates a model call instead of hitting the network
///
/// Sleeps for the request's nominal latency (virtual time under a paused
/// test clock) and reports exactly that latency back, so health tracking
/// stays deterministic. Token counts use the rough 4-bytes-per-token rule.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend;

#[async_trait]
impl ModelBackend for SimulatedBackend {
    async fn complete(&self, request: &BackendRequest) -> BackendResult<BackendResponse> {
        tokio::time::sleep(Duration::from_millis(request.nominal_latency_ms)).await;

        let input_tokens = (request.prompt.len() as u64 / 4).max(1);
        let output_tokens = u64::from(request.max_tokens.min(256)).max(1);
        Ok(BackendResponse {
            content: format!(
                "[{}] simulated completion ({} prompt tokens)",
                request.model_id, input_tokens
            ),
            input_tokens,
            output_tokens,
            latency_ms: request.nominal_latency_ms,
        })
    }
}
