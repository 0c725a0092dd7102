//! Provider registry data model
//!
//! A [`Provider`] bundles the models one vendor exposes, the capability tags
//! it advertises, its observed status, and a per-minute rate-limit window.
//! Selection and execution live in [`adapter`]; spend accounting in [`cost`].

pub mod adapter;
pub mod cost;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Length of one rate-limit window
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Vendor family a provider belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Google,
    Local,
    Custom,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Google => write!(f, "google"),
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::Custom => write!(f, "custom"),
        }
    }
}

/// Observed availability of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Available,
    Degraded,
    Unavailable,
    RateLimited,
    Maintenance,
}

impl ProviderStatus {
    /// Whether selection may hand work to a provider in this status
    pub fn is_selectable(&self) -> bool {
        matches!(self, ProviderStatus::Available | ProviderStatus::Degraded)
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderStatus::Available => write!(f, "available"),
            ProviderStatus::Degraded => write!(f, "degraded"),
            ProviderStatus::Unavailable => write!(f, "unavailable"),
            ProviderStatus::RateLimited => write!(f, "rate_limited"),
            ProviderStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// One model a provider exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier as the provider knows it
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Prompt context window in tokens
    pub context_length: u32,
    /// Output ceiling in tokens
    pub max_output_tokens: u32,
    pub supports_streaming: bool,
    pub supports_vision: bool,
    pub supports_function_calling: bool,
    /// Dollars per 1K prompt tokens
    pub input_cost_per_1k: f64,
    /// Dollars per 1K generated tokens
    pub output_cost_per_1k: f64,
}

impl ModelSpec {
    /// Create a model spec with streaming on and everything else off
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            context_length: 8_192,
            max_output_tokens: 4_096,
            supports_streaming: true,
            supports_vision: false,
            supports_function_calling: false,
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
        }
    }

    /// Set the context window
    pub fn with_context_length(mut self, tokens: u32) -> Self {
        self.context_length = tokens;
        self
    }

    /// Set the output ceiling
    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    /// Set per-1K input/output costs
    pub fn with_costs(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.input_cost_per_1k = input_per_1k;
        self.output_cost_per_1k = output_per_1k;
        self
    }

    /// Enable vision input
    pub fn with_vision(mut self) -> Self {
        self.supports_vision = true;
        self
    }

    /// Enable function calling
    pub fn with_function_calling(mut self) -> Self {
        self.supports_function_calling = true;
        self
    }

    /// Average of input and output per-1K cost, for tiering and caps
    pub fn blended_cost_per_1k(&self) -> f64 {
        (self.input_cost_per_1k + self.output_cost_per_1k) / 2.0
    }
}

/// Constraints a caller puts on the model picked for them
#[derive(Debug, Clone, Default)]
pub struct ModelConstraints {
    /// Minimum context window
    pub min_context_length: Option<u32>,
    /// Require this exact model id
    pub model_id: Option<String>,
    /// Require streaming support
    pub require_streaming: bool,
    /// Require vision support
    pub require_vision: bool,
    /// Reject models above this blended per-1K cost
    pub max_cost_per_1k: Option<f64>,
}

impl ModelConstraints {
    /// Constraints that accept any model
    pub fn any() -> Self {
        Self::default()
    }

    /// Require at least this much context
    pub fn min_context(mut self, tokens: u32) -> Self {
        self.min_context_length = Some(tokens);
        self
    }

    /// Require one specific model
    pub fn exact_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Require streaming support
    pub fn streaming(mut self) -> Self {
        self.require_streaming = true;
        self
    }

    /// Require vision support
    pub fn vision(mut self) -> Self {
        self.require_vision = true;
        self
    }

    /// Cap the blended per-1K cost
    pub fn max_cost(mut self, dollars_per_1k: f64) -> Self {
        self.max_cost_per_1k = Some(dollars_per_1k);
        self
    }

    /// Whether a model satisfies every constraint
    pub fn satisfied_by(&self, model: &ModelSpec) -> bool {
        if let Some(min) = self.min_context_length {
            if model.context_length < min {
                return false;
            }
        }
        if let Some(ref id) = self.model_id {
            if &model.id != id {
                return false;
            }
        }
        if self.require_streaming && !model.supports_streaming {
            return false;
        }
        if self.require_vision && !model.supports_vision {
            return false;
        }
        if let Some(max) = self.max_cost_per_1k {
            if model.blended_cost_per_1k() > max {
                return false;
            }
        }
        true
    }
}

/// Per-minute request/token counters for one provider
#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    /// Requests allowed per window
    pub requests_per_minute: u32,
    /// Tokens allowed per window
    pub tokens_per_minute: u64,
    /// Requests seen this window
    pub request_count: u32,
    /// Tokens seen this window
    pub token_count: u64,
    /// When the current window opened
    pub window_started_at: Instant,
}

impl RateLimitWindow {
    /// Create a window with the given per-minute allowances
    pub fn new(requests_per_minute: u32, tokens_per_minute: u64) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
            request_count: 0,
            token_count: 0,
            window_started_at: Instant::now(),
        }
    }

    /// Count one request and its token usage against the window
    pub fn record(&mut self, tokens: u64) {
        self.request_count += 1;
        self.token_count = self.token_count.saturating_add(tokens);
    }

    /// Whether either allowance is used up
    pub fn is_exhausted(&self) -> bool {
        self.request_count >= self.requests_per_minute
            || self.token_count >= self.tokens_per_minute
    }

    /// Whether the window boundary has passed
    pub fn should_reset(&self) -> bool {
        self.window_started_at.elapsed() >= RATE_WINDOW
    }

    /// Open a fresh window
    pub fn reset(&mut self) {
        self.request_count = 0;
        self.token_count = 0;
        self.window_started_at = Instant::now();
    }

    /// Fraction of the request allowance still unused, in [0, 1]
    pub fn request_headroom(&self) -> f64 {
        if self.requests_per_minute == 0 {
            return 0.0;
        }
        let remaining = self.requests_per_minute.saturating_sub(self.request_count);
        f64::from(remaining) / f64::from(self.requests_per_minute)
    }

    /// Milliseconds until the current window expires
    pub fn resets_in_ms(&self) -> u64 {
        RATE_WINDOW
            .saturating_sub(self.window_started_at.elapsed())
            .as_millis() as u64
    }
}

impl Default for RateLimitWindow {
    fn default() -> Self {
        Self::new(60, 100_000)
    }
}

/// Rolling call statistics for one provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Running average over all requests
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl ProviderMetrics {
    /// Success fraction; a provider with no history counts as fully healthy
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    /// Record one successful call
    pub fn record_success(&mut self, latency_ms: u64, tokens: u64, cost: f64) {
        self.successful_requests += 1;
        self.total_tokens = self.total_tokens.saturating_add(tokens);
        self.total_cost += cost;
        self.observe_latency(latency_ms);
    }

    /// Record one failed call
    pub fn record_failure(&mut self, latency_ms: u64) {
        self.failed_requests += 1;
        self.observe_latency(latency_ms);
    }

    fn observe_latency(&mut self, latency_ms: u64) {
        let n = self.total_requests as f64;
        self.avg_latency_ms = (self.avg_latency_ms * n + latency_ms as f64) / (n + 1.0);
        self.total_requests += 1;
    }
}

/// One registered AI-model provider
#[derive(Debug, Clone)]
pub struct Provider {
    /// Registry key
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Vendor family
    pub kind: ProviderKind,
    /// Models this provider serves
    pub models: Vec<ModelSpec>,
    /// Capability tags the provider advertises
    pub capabilities: Vec<String>,
    /// Observed availability
    pub status: ProviderStatus,
    /// Per-minute rate-limit window
    pub rate_limits: RateLimitWindow,
    /// When the provider was registered
    pub registered_at: DateTime<Utc>,
}

impl Provider {
    /// Create a provider with no models and default rate limits
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            models: Vec::new(),
            capabilities: Vec::new(),
            status: ProviderStatus::Available,
            rate_limits: RateLimitWindow::default(),
            registered_at: Utc::now(),
        }
    }

    /// Add a model
    pub fn with_model(mut self, model: ModelSpec) -> Self {
        self.models.push(model);
        self
    }

    /// Add a capability tag
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Replace the capability set
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set per-minute rate-limit allowances
    pub fn with_rate_limits(mut self, requests_per_minute: u32, tokens_per_minute: u64) -> Self {
        self.rate_limits = RateLimitWindow::new(requests_per_minute, tokens_per_minute);
        self
    }

    /// Set the initial status
    pub fn with_status(mut self, status: ProviderStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the provider advertises every required capability
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|req| {
            self.capabilities
                .iter()
                .any(|cap| cap.eq_ignore_ascii_case(req))
        })
    }

    /// Cheapest model satisfying the constraints, if any
    pub fn matching_model(&self, constraints: &ModelConstraints) -> Option<&ModelSpec> {
        self.models
            .iter()
            .filter(|m| constraints.satisfied_by(m))
            .min_by(|a, b| {
                a.blended_cost_per_1k()
                    .partial_cmp(&b.blended_cost_per_1k())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn two_model_provider() -> Provider {
        Provider::new("acme", "Acme AI", ProviderKind::Custom)
            .with_capability("text-generation")
            .with_capability("code")
            .with_model(
                ModelSpec::new("acme-large", "Acme Large")
                    .with_context_length(200_000)
                    .with_costs(0.01, 0.03)
                    .with_vision(),
            )
            .with_model(
                ModelSpec::new("acme-small", "Acme Small")
                    .with_context_length(16_000)
                    .with_costs(0.0002, 0.0008),
            )
    }

    #[test]
    fn test_matching_model_picks_cheapest() {
        let provider = two_model_provider();
        let model = provider.matching_model(&ModelConstraints::any()).unwrap();
        assert_eq!(model.id, "acme-small");
    }

    #[test]
    fn test_matching_model_honors_constraints() {
        let provider = two_model_provider();

        let model = provider
            .matching_model(&ModelConstraints::any().min_context(100_000))
            .unwrap();
        assert_eq!(model.id, "acme-large");

        let model = provider
            .matching_model(&ModelConstraints::any().vision())
            .unwrap();
        assert_eq!(model.id, "acme-large");

        assert!(provider
            .matching_model(&ModelConstraints::any().min_context(100_000).max_cost(0.001))
            .is_none());
    }

    #[test]
    fn test_capability_check_ignores_case() {
        let provider = two_model_provider();
        assert!(provider.has_capabilities(&["CODE".to_string()]));
        assert!(!provider.has_capabilities(&["vision-ocr".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_exhaustion_and_reset() {
        let mut window = RateLimitWindow::new(2, 1_000);
        assert!(!window.is_exhausted());

        window.record(100);
        window.record(100);
        assert!(window.is_exhausted());
        assert_eq!(window.request_headroom(), 0.0);
        assert!(!window.should_reset());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(window.should_reset());
        window.reset();
        assert!(!window.is_exhausted());
        assert_eq!(window.request_headroom(), 1.0);
    }

    #[test]
    fn test_metrics_running_average_and_rate() {
        let mut metrics = ProviderMetrics::default();
        assert_eq!(metrics.success_rate(), 1.0);

        metrics.record_success(100, 500, 0.01);
        metrics.record_success(300, 500, 0.01);
        metrics.record_failure(200);

        assert_eq!(metrics.total_requests, 3);
        assert!((metrics.avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert!((metrics.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.total_cost - 0.02).abs() < 1e-9);
    }
}
