//! Provider selection and execution
//!
//! The adapter owns the provider registry and its paired per-provider
//! metrics, picks the best provider/model for a requirement set, and runs
//! completions with response caching, an hourly cost ceiling, rate-limit
//! bookkeeping, retry with backoff, and failover to alternative providers.
//!
//! Execution failures never surface as `Err`: after retries and failover
//! are exhausted the caller gets a structured `success: false` response.
//! `Err` is reserved for pre-work refusals (unknown provider, rate limit,
//! cost ceiling) and configuration mistakes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::backend::{BackendRequest, SharedModelBackend, SimulatedBackend};
use crate::events::{RouterEvent, SharedRouterBus};
use crate::provider::cost::{CostSnapshot, CostTracker};
use crate::provider::{
    ModelConstraints, ModelSpec, Provider, ProviderKind, ProviderMetrics, ProviderStatus,
};

/// Cooldown before a rate-limited provider is automatically re-opened
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Latency the simulated backend exhibits for adapter-issued calls
const SIMULATED_LATENCY_MS: u64 = 120;

/// Success rate below which a provider with enough history goes unavailable
const UNAVAILABLE_BELOW: f64 = 0.5;
/// Success rate below which a provider with some history degrades
const DEGRADED_BELOW: f64 = 0.8;

/// Error type for adapter operations
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider {provider_id} is not registered")]
    NotRegistered { provider_id: String },

    #[error("provider {provider_id} is already registered")]
    AlreadyRegistered { provider_id: String },

    #[error("no provider satisfies the requirements: {reason}")]
    NoSuitableProvider { reason: String },

    #[error("provider {provider_id} is rate-limited")]
    RateLimited { provider_id: String },

    #[error("hourly cost ceiling reached (${spent:.4} of ${ceiling:.4})")]
    CostCeilingExceeded { spent: f64, ceiling: f64 },

    #[error("invalid adapter config: {reason}")]
    InvalidConfig { reason: String },

    #[error("adapter state lock poisoned")]
    LockPoisoned,
}

impl ProviderError {
    fn invalid_config(reason: impl Into<String>) -> Self {
        ProviderError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Result type for adapter operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Shared reference to a provider adapter
pub type SharedProviderAdapter = Arc<ProviderAdapter>;

/// Retry schedule for one provider's attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts against one provider before giving up on it
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff_ms: u64,
    /// Multiplier applied per subsequent attempt
    pub backoff_multiplier: f64,
    /// Ceiling on any single delay
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given 1-based failed attempt
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_backoff_ms as f64 * factor;
        (delay as u64).min(self.max_backoff_ms)
    }
}

/// Adapter-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Alternative providers tried after the primary fails
    pub max_failover_attempts: u32,
    /// Serve repeated identical requests from memory
    pub enable_cache: bool,
    /// How long a cached response stays valid
    pub cache_ttl_ms: u64,
    /// Hard stop on spend within the current hour
    pub hourly_cost_ceiling: Option<f64>,
    /// Interval between background health sweeps
    pub health_check_interval_ms: u64,
    /// Per-provider retry schedule
    pub retry: RetryPolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_failover_attempts: 2,
            enable_cache: true,
            cache_ttl_ms: 300_000,
            hourly_cost_ceiling: None,
            health_check_interval_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl AdapterConfig {
    /// Check the knobs for internal consistency
    pub fn validate(&self) -> ProviderResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(ProviderError::invalid_config(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ProviderError::invalid_config(
                "retry.backoff_multiplier must be at least 1.0",
            ));
        }
        if self.enable_cache && self.cache_ttl_ms == 0 {
            return Err(ProviderError::invalid_config(
                "cache_ttl_ms must be positive when the cache is enabled",
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(ProviderError::invalid_config(
                "health_check_interval_ms must be positive",
            ));
        }
        if let Some(ceiling) = self.hourly_cost_ceiling {
            if ceiling <= 0.0 {
                return Err(ProviderError::invalid_config(
                    "hourly_cost_ceiling must be positive when set",
                ));
            }
        }
        Ok(())
    }
}

/// What a caller needs from a provider
#[derive(Clone, Default)]
pub struct ProviderRequirements {
    /// Capability tags the provider must advertise
    pub required_capabilities: Vec<String>,
    /// Restrict selection to these vendor families (empty = no restriction)
    pub preferred_kinds: Vec<ProviderKind>,
    /// Provider ids selection must skip
    pub excluded_providers: Vec<String>,
    /// Constraints on the model picked within a provider
    pub constraints: ModelConstraints,
    /// Arbitrary caller-supplied filters
    pub predicates: Vec<Arc<dyn Fn(&Provider) -> bool + Send + Sync>>,
}

impl ProviderRequirements {
    /// Requirements that accept any selectable provider
    pub fn any() -> Self {
        Self::default()
    }

    /// Require a capability tag
    pub fn require_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    /// Restrict selection to a vendor family
    pub fn prefer_kind(mut self, kind: ProviderKind) -> Self {
        self.preferred_kinds.push(kind);
        self
    }

    /// Skip a provider id
    pub fn exclude(mut self, provider_id: impl Into<String>) -> Self {
        self.excluded_providers.push(provider_id.into());
        self
    }

    /// Constrain the model picked within a provider
    pub fn with_constraints(mut self, constraints: ModelConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Add a custom provider filter
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Provider) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }
}

impl std::fmt::Debug for ProviderRequirements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRequirements")
            .field("required_capabilities", &self.required_capabilities)
            .field("preferred_kinds", &self.preferred_kinds)
            .field("excluded_providers", &self.excluded_providers)
            .field("constraints", &self.constraints)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

/// One inference request as the adapter sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceTask {
    /// Caller-assigned id, part of the cache key
    pub id: String,
    /// Free-text description, part of the cache key
    pub description: String,
    /// Prompt sent to the model
    pub prompt: String,
    /// Output token ceiling
    pub max_tokens: u32,
    /// Capabilities any failover target must advertise
    pub required_capabilities: Vec<String>,
}

impl InferenceTask {
    /// Create a task whose prompt is its description
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            id: id.into(),
            prompt: description.clone(),
            description,
            max_tokens: 512,
            required_capabilities: Vec::new(),
        }
    }

    /// Set an explicit prompt
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Set the output token ceiling
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Require a capability from failover targets
    pub fn require_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }
}

/// Outcome of one adapter execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Provider that produced (or last attempted) the response
    pub provider_id: String,
    /// Model called, empty when every attempt failed before a call resolved
    pub model_id: String,
    /// Task this responds to
    pub task_id: String,
    /// Whether a completion came back
    pub success: bool,
    /// Generated text on success
    pub content: Option<String>,
    /// Terminal error on failure
    pub error: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    /// Dollars attributed to this call
    pub cost: f64,
    /// Whether the response came from the cache
    pub cached: bool,
    pub completed_at: DateTime<Utc>,
}

/// A scored provider/model pick
#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub provider_id: String,
    pub model_id: String,
    pub score: f64,
}

/// Aggregate adapter statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterStats {
    pub providers: usize,
    pub available: usize,
    pub degraded: usize,
    pub unavailable: usize,
    pub rate_limited: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Live response-cache entries, expired ones included until swept
    pub cached_responses: usize,
    pub costs: CostSnapshot,
}

struct CacheEntry {
    response: ProviderResponse,
    cached_at: Instant,
}

/// Score one provider/model pair against the requirements
///
/// Base 100; status ±; cost tier on the model's blended per-1K cost
/// (≤ $0.001 +15, ≤ $0.01 +5, > $0.05 −10); rate-limit headroom up to +10;
/// historical success rate up to +20; latency penalty of 1 point per
/// second beyond 5000 ms average, capped at 20; preferred vendor family
/// +15; 100k+ context +5.
pub fn provider_score(
    provider: &Provider,
    metrics: &ProviderMetrics,
    reqs: &ProviderRequirements,
    model: &ModelSpec,
) -> f64 {
    let mut score = 100.0;

    score += match provider.status {
        ProviderStatus::Available => 20.0,
        ProviderStatus::Degraded => -10.0,
        _ => 0.0,
    };

    let blended = model.blended_cost_per_1k();
    if blended <= 0.001 {
        score += 15.0;
    } else if blended <= 0.01 {
        score += 5.0;
    } else if blended > 0.05 {
        score -= 10.0;
    }

    score += provider.rate_limits.request_headroom() * 10.0;
    score += metrics.success_rate() * 20.0;

    if metrics.avg_latency_ms > 5000.0 {
        score -= ((metrics.avg_latency_ms - 5000.0) / 1000.0).min(20.0);
    }
    if reqs.preferred_kinds.contains(&provider.kind) {
        score += 15.0;
    }
    if model.context_length >= 100_000 {
        score += 5.0;
    }
    score
}

fn cache_key(provider_id: &str, task: &InferenceTask) -> String {
    blake3::hash(format!("{provider_id}:{}:{}", task.id, task.description).as_bytes())
        .to_hex()
        .to_string()
}

/// Registry of AI-model providers with selection, execution, and failover
pub struct ProviderAdapter {
    config: AdapterConfig,
    providers: Arc<RwLock<HashMap<String, Provider>>>,
    metrics: Arc<RwLock<HashMap<String, ProviderMetrics>>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    costs: Mutex<CostTracker>,
    backend: SharedModelBackend,
    events: SharedRouterBus,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl ProviderAdapter {
    /// Create an adapter backed by the simulated backend
    pub fn new(config: AdapterConfig, events: SharedRouterBus) -> ProviderResult<Self> {
        Self::with_backend(config, Arc::new(SimulatedBackend), events)
    }

    /// Create an adapter with an injected backend
    pub fn with_backend(
        config: AdapterConfig,
        backend: SharedModelBackend,
        events: SharedRouterBus,
    ) -> ProviderResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            providers: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(RwLock::new(HashMap::new())),
            cache: Mutex::new(HashMap::new()),
            costs: Mutex::new(CostTracker::new()),
            backend,
            events,
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Wrap the adapter in an `Arc` for sharing with background loops
    pub fn shared(self) -> SharedProviderAdapter {
        Arc::new(self)
    }

    /// Adapter configuration
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Event bus the adapter publishes on
    pub fn events(&self) -> &SharedRouterBus {
        &self.events
    }

    /// Register a provider and create its paired metrics entry
    pub async fn register_provider(&self, provider: Provider) -> ProviderResult<()> {
        if provider.id.trim().is_empty() {
            return Err(ProviderError::invalid_config("provider id must not be empty"));
        }

        let mut providers = self.providers.write().await;
        let mut metrics = self.metrics.write().await;
        if providers.contains_key(&provider.id) {
            return Err(ProviderError::AlreadyRegistered {
                provider_id: provider.id,
            });
        }

        info!(provider_id = %provider.id, kind = %provider.kind, models = provider.models.len(), "provider registered");
        self.events.publish(RouterEvent::ProviderRegistered {
            provider_id: provider.id.clone(),
            kind: provider.kind.to_string(),
            timestamp: Utc::now(),
        });
        metrics.insert(provider.id.clone(), ProviderMetrics::default());
        providers.insert(provider.id.clone(), provider);
        Ok(())
    }

    /// Remove a provider and its metrics entry
    pub async fn unregister_provider(&self, provider_id: &str) -> ProviderResult<Provider> {
        let mut providers = self.providers.write().await;
        let mut metrics = self.metrics.write().await;
        let provider =
            providers
                .remove(provider_id)
                .ok_or_else(|| ProviderError::NotRegistered {
                    provider_id: provider_id.to_string(),
                })?;
        metrics.remove(provider_id);

        info!(provider_id, "provider unregistered");
        self.events.publish(RouterEvent::ProviderUnregistered {
            provider_id: provider_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(provider)
    }

    /// Snapshot of one provider
    pub async fn provider(&self, provider_id: &str) -> Option<Provider> {
        self.providers.read().await.get(provider_id).cloned()
    }

    /// Snapshot of one provider's metrics
    pub async fn metrics_for(&self, provider_id: &str) -> Option<ProviderMetrics> {
        self.metrics.read().await.get(provider_id).cloned()
    }

    /// Force a provider's status, for maintenance windows and tests
    pub async fn set_provider_status(
        &self,
        provider_id: &str,
        status: ProviderStatus,
    ) -> ProviderResult<()> {
        let mut providers = self.providers.write().await;
        let provider = providers
            .get_mut(provider_id)
            .ok_or_else(|| ProviderError::NotRegistered {
                provider_id: provider_id.to_string(),
            })?;
        if provider.status != status {
            provider.status = status;
            self.events.publish(RouterEvent::HealthChanged {
                provider_id: provider_id.to_string(),
                status: status.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Pick the best provider/model pair for the requirements
    ///
    /// Filters to selectable (available or degraded) providers that are not
    /// excluded, advertise every required capability, match the preferred
    /// vendor families, pass every predicate, and hold at least one model
    /// satisfying the constraints; the survivor with the highest
    /// [`provider_score`] wins.
    pub async fn select_provider(
        &self,
        reqs: &ProviderRequirements,
    ) -> ProviderResult<ProviderSelection> {
        let providers = self.providers.read().await;
        let metrics = self.metrics.read().await;

        let mut best: Option<ProviderSelection> = None;
        for provider in providers.values() {
            if !provider.status.is_selectable() {
                continue;
            }
            if reqs.excluded_providers.iter().any(|e| e == &provider.id) {
                continue;
            }
            if !provider.has_capabilities(&reqs.required_capabilities) {
                continue;
            }
            if !reqs.preferred_kinds.is_empty() && !reqs.preferred_kinds.contains(&provider.kind)
            {
                continue;
            }
            if !reqs.predicates.iter().all(|p| p(provider)) {
                continue;
            }
            let Some(model) = provider.matching_model(&reqs.constraints) else {
                continue;
            };

            let default_stats = ProviderMetrics::default();
            let stats = metrics.get(&provider.id).unwrap_or(&default_stats);
            let score = provider_score(provider, stats, reqs, model);
            if best.as_ref().is_none_or(|b| score > b.score) {
                best = Some(ProviderSelection {
                    provider_id: provider.id.clone(),
                    model_id: model.id.clone(),
                    score,
                });
            }
        }

        let selection = best.ok_or_else(|| ProviderError::NoSuitableProvider {
            reason: format!(
                "none of {} registered providers passed the filters",
                providers.len()
            ),
        })?;

        debug!(
            provider_id = %selection.provider_id,
            model_id = %selection.model_id,
            score = selection.score,
            "provider selected"
        );
        self.events.publish(RouterEvent::ProviderSelected {
            provider_id: selection.provider_id.clone(),
            model_id: selection.model_id.clone(),
            score: selection.score,
            timestamp: Utc::now(),
        });
        Ok(selection)
    }

    /// Execute a task against a named provider
    ///
    /// Order of gates: cache, hourly cost ceiling, rate limit (with lazy
    /// window reset). Then up to `retry.max_attempts` calls with backoff,
    /// and on exhaustion failover through `select_provider` excluding every
    /// provider already tried.
    pub async fn execute_with_provider(
        &self,
        provider_id: &str,
        task: &InferenceTask,
    ) -> ProviderResult<ProviderResponse> {
        if provider_id.trim().is_empty() {
            return Err(ProviderError::invalid_config("provider id must not be empty"));
        }
        if task.id.trim().is_empty() {
            return Err(ProviderError::invalid_config("task id must not be empty"));
        }

        if self.config.enable_cache {
            if let Some(hit) = self.cache_lookup(provider_id, task)? {
                debug!(provider_id, task_id = %task.id, "cache hit");
                self.events.publish(RouterEvent::CacheHit {
                    provider_id: provider_id.to_string(),
                    task_id: task.id.clone(),
                    timestamp: Utc::now(),
                });
                return Ok(hit);
            }
        }

        if let Some(ceiling) = self.config.hourly_cost_ceiling {
            let spent = self
                .costs
                .lock()
                .map_err(|_| ProviderError::LockPoisoned)?
                .hour_total();
            if spent >= ceiling {
                return Err(ProviderError::CostCeilingExceeded { spent, ceiling });
            }
        }

        self.ensure_not_rate_limited(provider_id).await?;

        match self.attempt_with_retries(provider_id, task).await? {
            Ok(response) => {
                self.cache_store(provider_id, task, &response)?;
                Ok(response)
            }
            Err(primary_error) => self.failover(provider_id, task, primary_error).await,
        }
    }

    /// Refuse a currently rate-limited provider, resetting a window whose
    /// boundary has already passed
    async fn ensure_not_rate_limited(&self, provider_id: &str) -> ProviderResult<()> {
        let mut providers = self.providers.write().await;
        let provider = providers
            .get_mut(provider_id)
            .ok_or_else(|| ProviderError::NotRegistered {
                provider_id: provider_id.to_string(),
            })?;

        if provider.status == ProviderStatus::RateLimited {
            if provider.rate_limits.should_reset() {
                provider.rate_limits.reset();
                provider.status = ProviderStatus::Available;
                info!(provider_id, "rate limit window expired, provider re-opened");
            } else {
                return Err(ProviderError::RateLimited {
                    provider_id: provider_id.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn attempt_with_retries(
        &self,
        provider_id: &str,
        task: &InferenceTask,
    ) -> ProviderResult<Result<ProviderResponse, String>> {
        let model = {
            let providers = self.providers.read().await;
            let provider =
                providers
                    .get(provider_id)
                    .ok_or_else(|| ProviderError::NotRegistered {
                        provider_id: provider_id.to_string(),
                    })?;
            provider
                .matching_model(&ModelConstraints::any())
                .ok_or_else(|| ProviderError::NoSuitableProvider {
                    reason: format!("provider {provider_id} exposes no models"),
                })?
                .clone()
        };

        let request = BackendRequest {
            provider_id: provider_id.to_string(),
            model_id: model.id.clone(),
            prompt: task.prompt.clone(),
            max_tokens: task.max_tokens,
            nominal_latency_ms: SIMULATED_LATENCY_MS,
        };

        let mut last_error = String::new();
        for attempt in 1..=self.config.retry.max_attempts {
            let started = Instant::now();
            match self.backend.complete(&request).await {
                Ok(resp) => {
                    let tokens = resp.input_tokens + resp.output_tokens;
                    let cost = resp.input_tokens as f64 / 1000.0 * model.input_cost_per_1k
                        + resp.output_tokens as f64 / 1000.0 * model.output_cost_per_1k;
                    self.record_success(provider_id, resp.latency_ms, tokens, cost)
                        .await?;
                    return Ok(Ok(ProviderResponse {
                        provider_id: provider_id.to_string(),
                        model_id: model.id.clone(),
                        task_id: task.id.clone(),
                        success: true,
                        content: Some(resp.content),
                        error: None,
                        input_tokens: resp.input_tokens,
                        output_tokens: resp.output_tokens,
                        latency_ms: resp.latency_ms,
                        cost,
                        cached: false,
                        completed_at: Utc::now(),
                    }));
                }
                Err(err) => {
                    last_error = err.to_string();
                    self.record_failure(provider_id, started.elapsed().as_millis() as u64)
                        .await;
                    warn!(provider_id, attempt, error = %last_error, "provider call failed");
                    if attempt < self.config.retry.max_attempts {
                        let delay = self.config.retry.backoff_ms(attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }
        Ok(Err(last_error))
    }

    /// Try alternative providers after the primary exhausted its retries
    ///
    /// Execution failures end as a structured `success: false` response,
    /// never an `Err`.
    async fn failover(
        &self,
        failed_provider: &str,
        task: &InferenceTask,
        primary_error: String,
    ) -> ProviderResult<ProviderResponse> {
        let mut tried = vec![failed_provider.to_string()];
        let mut last_error = primary_error;

        for _ in 0..self.config.max_failover_attempts {
            let reqs = ProviderRequirements {
                required_capabilities: task.required_capabilities.clone(),
                excluded_providers: tried.clone(),
                ..ProviderRequirements::default()
            };
            let Ok(selection) = self.select_provider(&reqs).await else {
                break;
            };
            info!(
                failed = %tried.last().map(String::as_str).unwrap_or(failed_provider),
                next = %selection.provider_id,
                "failing over"
            );
            match self.attempt_with_retries(&selection.provider_id, task).await? {
                Ok(response) => {
                    self.cache_store(failed_provider, task, &response)?;
                    return Ok(response);
                }
                Err(err) => {
                    last_error = err;
                    tried.push(selection.provider_id);
                }
            }
        }

        warn!(task_id = %task.id, providers_tried = tried.len(), error = %last_error, "all providers failed");
        Ok(ProviderResponse {
            provider_id: tried
                .last()
                .cloned()
                .unwrap_or_else(|| failed_provider.to_string()),
            model_id: String::new(),
            task_id: task.id.clone(),
            success: false,
            content: None,
            error: Some(last_error),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            cost: 0.0,
            cached: false,
            completed_at: Utc::now(),
        })
    }

    async fn record_success(
        &self,
        provider_id: &str,
        latency_ms: u64,
        tokens: u64,
        cost: f64,
    ) -> ProviderResult<()> {
        {
            let mut providers = self.providers.write().await;
            let mut metrics = self.metrics.write().await;
            metrics
                .entry(provider_id.to_string())
                .or_default()
                .record_success(latency_ms, tokens, cost);

            if let Some(provider) = providers.get_mut(provider_id) {
                if provider.rate_limits.should_reset() {
                    provider.rate_limits.reset();
                }
                provider.rate_limits.record(tokens);
                if provider.rate_limits.is_exhausted()
                    && provider.status != ProviderStatus::RateLimited
                {
                    provider.status = ProviderStatus::RateLimited;
                    warn!(provider_id, "rate limit reached");
                    self.events.publish(RouterEvent::RateLimited {
                        provider_id: provider_id.to_string(),
                        resets_in_ms: RATE_LIMIT_COOLDOWN.as_millis() as u64,
                        timestamp: Utc::now(),
                    });
                    self.schedule_rate_limit_reset(provider_id.to_string());
                }
            }
        }

        self.costs
            .lock()
            .map_err(|_| ProviderError::LockPoisoned)?
            .record(cost);
        Ok(())
    }

    async fn record_failure(&self, provider_id: &str, latency_ms: u64) {
        let mut metrics = self.metrics.write().await;
        metrics
            .entry(provider_id.to_string())
            .or_default()
            .record_failure(latency_ms);
    }

    /// Re-open a rate-limited provider after the cooldown
    fn schedule_rate_limit_reset(&self, provider_id: String) {
        let providers = Arc::clone(&self.providers);
        let events = self.events.clone();
        let token = self.shutdown_token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(RATE_LIMIT_COOLDOWN) => {
                    let mut providers = providers.write().await;
                    if let Some(provider) = providers.get_mut(&provider_id) {
                        if provider.status == ProviderStatus::RateLimited {
                            provider.rate_limits.reset();
                            provider.status = ProviderStatus::Available;
                            info!(provider_id = %provider_id, "rate limit cooldown elapsed");
                            events.publish(RouterEvent::HealthChanged {
                                provider_id: provider_id.clone(),
                                status: ProviderStatus::Available.to_string(),
                                timestamp: Utc::now(),
                            });
                        }
                    }
                }
            }
        });
    }

    fn cache_lookup(
        &self,
        provider_id: &str,
        task: &InferenceTask,
    ) -> ProviderResult<Option<ProviderResponse>> {
        let key = cache_key(provider_id, task);
        let ttl = Duration::from_millis(self.config.cache_ttl_ms);
        let mut cache = self.cache.lock().map_err(|_| ProviderError::LockPoisoned)?;
        match cache.get(&key) {
            Some(entry) if entry.cached_at.elapsed() < ttl => {
                let mut response = entry.response.clone();
                response.cached = true;
                Ok(Some(response))
            }
            Some(_) => {
                cache.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Cache a successful response under the provider the caller asked for,
    /// so an identical request hits even after a failover
    fn cache_store(
        &self,
        requested_provider: &str,
        task: &InferenceTask,
        response: &ProviderResponse,
    ) -> ProviderResult<()> {
        if !self.config.enable_cache || !response.success {
            return Ok(());
        }
        let key = cache_key(requested_provider, task);
        let ttl = Duration::from_millis(self.config.cache_ttl_ms);
        let mut cache = self.cache.lock().map_err(|_| ProviderError::LockPoisoned)?;
        // Lookups only evict their own key, so stale one-off entries are
        // swept here instead of piling up until shutdown.
        cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        cache.insert(
            key,
            CacheEntry {
                response: response.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Recompute provider status from rolling success rates
    ///
    /// Under 50% over more than 10 requests goes unavailable; under 80%
    /// over more than 5 degrades; otherwise available. Rate-limited and
    /// maintenance providers are left alone. Returns the number of status
    /// changes.
    pub async fn refresh_health(&self) -> usize {
        let mut providers = self.providers.write().await;
        let metrics = self.metrics.read().await;

        let mut changes = 0;
        for provider in providers.values_mut() {
            if matches!(
                provider.status,
                ProviderStatus::RateLimited | ProviderStatus::Maintenance
            ) {
                continue;
            }
            let Some(stats) = metrics.get(&provider.id) else {
                continue;
            };

            let rate = stats.success_rate();
            let next = if stats.total_requests > 10 && rate < UNAVAILABLE_BELOW {
                ProviderStatus::Unavailable
            } else if stats.total_requests > 5 && rate < DEGRADED_BELOW {
                ProviderStatus::Degraded
            } else {
                ProviderStatus::Available
            };

            if next != provider.status {
                info!(
                    provider_id = %provider.id,
                    from = %provider.status,
                    to = %next,
                    success_rate = rate,
                    "provider health changed"
                );
                provider.status = next;
                self.events.publish(RouterEvent::HealthChanged {
                    provider_id: provider.id.clone(),
                    status: next.to_string(),
                    timestamp: Utc::now(),
                });
                changes += 1;
            }
        }
        changes
    }

    /// Start the background health sweep loop
    ///
    /// Safe to call once per adapter; repeated calls are ignored.
    pub fn start_health_loop(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let adapter = Arc::clone(self);
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
                        adapter.refresh_health().await;
                    }
                }
            }
        });
    }

    /// Stop background work and drop pending rate-limit resets
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Aggregate statistics over the registry
    pub async fn stats(&self) -> ProviderResult<AdapterStats> {
        let providers = self.providers.read().await;
        let metrics = self.metrics.read().await;

        let mut stats = AdapterStats {
            providers: providers.len(),
            available: 0,
            degraded: 0,
            unavailable: 0,
            rate_limited: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            cached_responses: self
                .cache
                .lock()
                .map_err(|_| ProviderError::LockPoisoned)?
                .len(),
            costs: self
                .costs
                .lock()
                .map_err(|_| ProviderError::LockPoisoned)?
                .snapshot(),
        };
        for provider in providers.values() {
            match provider.status {
                ProviderStatus::Available => stats.available += 1,
                ProviderStatus::Degraded => stats.degraded += 1,
                ProviderStatus::Unavailable => stats.unavailable += 1,
                ProviderStatus::RateLimited => stats.rate_limited += 1,
                ProviderStatus::Maintenance => {}
            }
        }
        for entry in metrics.values() {
            stats.total_requests += entry.total_requests;
            stats.successful_requests += entry.successful_requests;
            stats.failed_requests += entry.failed_requests;
        }
        Ok(stats)
    }
}
