//! Multi-model routing with weighted objectives, rules, and circuit breakers
//!
//! The router holds a catalog of [`ModelConfig`]s and picks one per request:
//! hard bounds and capability requirements exclude candidates outright, open
//! circuits hide their provider's models, an optional rule table
//! short-circuits scoring, and the survivors are ranked under the configured
//! [`RoutingMode`]. [`MultiModelRouter::complete`] executes the pick through
//! the injected backend, feeding provider health, circuit breakers, and the
//! budget tracker from the outcome.
//!
//! Execution failures never surface as `Err`: retries exhaust into a
//! structured `success: false` result. `Err` is reserved for routing dead
//! ends, open circuits, and configuration mistakes.

pub mod budget;
pub mod catalog;
pub mod circuit;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backend::{BackendRequest, SharedModelBackend, SimulatedBackend};
use crate::events::{RouterEvent, SharedRouterBus};
use crate::provider::adapter::RetryPolicy;
use crate::provider::ProviderKind;
use budget::{BudgetConfig, BudgetSnapshot, BudgetTracker};
use catalog::{default_catalog, Capability, ModelConfig};
use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ProviderHealth};

/// Blended per-1K cost treated as the ceiling by cost scoring
const COST_CEILING_PER_1K: f64 = 0.10;
/// Nominal latency treated as the ceiling by performance scoring
const LATENCY_CEILING_MS: f64 = 2_000.0;
/// Runners-up reported alongside a routing decision
const MAX_ALTERNATIVES: usize = 3;
/// Score multiplier for local models when `prefer_local` is set
const LOCAL_MULTIPLIER: f64 = 1.1;
/// Score multiplier for the preferred provider family
const PREFERRED_PROVIDER_MULTIPLIER: f64 = 1.15;
/// Score multiplier for the preferred model
const PREFERRED_MODEL_MULTIPLIER: f64 = 1.2;

/// Error type for router operations
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no model in the catalog satisfies the request: {reason}")]
    NoEligibleModel { reason: String },

    #[error("model {model_id} is not in the catalog")]
    UnknownModel { model_id: String },

    #[error("model {model_id} is already in the catalog")]
    DuplicateModel { model_id: String },

    #[error("circuit for provider {provider} is open, resets in {resets_in_ms}ms")]
    CircuitOpen { provider: String, resets_in_ms: u64 },

    #[error("invalid router config: {reason}")]
    InvalidConfig { reason: String },

    #[error("router state lock poisoned")]
    LockPoisoned,
}

impl RouterError {
    fn invalid_config(reason: impl Into<String>) -> Self {
        RouterError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Shared reference to a router
pub type SharedMultiModelRouter = Arc<MultiModelRouter>;

/// Objective the router optimizes when scoring candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Cheapest blended per-1K cost wins
    CostOptimized,
    /// Lowest nominal latency wins
    PerformanceOptimized,
    /// Highest quality score wins
    QualityOptimized,
    /// Blend of the three under [`RoutingWeights`]
    Weighted,
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingMode::CostOptimized => write!(f, "cost_optimized"),
            RoutingMode::PerformanceOptimized => write!(f, "performance_optimized"),
            RoutingMode::QualityOptimized => write!(f, "quality_optimized"),
            RoutingMode::Weighted => write!(f, "weighted"),
        }
    }
}

/// Objective blend for [`RoutingMode::Weighted`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutingWeights {
    pub cost: f64,
    pub latency: f64,
    pub quality: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            cost: 0.4,
            latency: 0.3,
            quality: 0.3,
        }
    }
}

/// Explicit routing override, checked before any scoring
///
/// The first rule whose filters all match the request, and whose target
/// model survived filtering, wins outright. A rule with no filters matches
/// every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Rule name, reported on the decision
    pub name: String,
    /// Match only requests with this task type
    pub task_type: Option<String>,
    /// Match only descriptions containing this substring, case-insensitive
    pub description_contains: Option<String>,
    /// Model the rule routes to
    pub target_model: String,
}

impl RoutingRule {
    /// Create a rule routing everything to one model
    pub fn new(name: impl Into<String>, target_model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: None,
            description_contains: None,
            target_model: target_model.into(),
        }
    }

    /// Restrict the rule to one task type
    pub fn for_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Restrict the rule to descriptions containing a substring
    pub fn when_description_contains(mut self, needle: impl Into<String>) -> Self {
        self.description_contains = Some(needle.into());
        self
    }

    /// Whether the rule matches the request
    pub fn matches(&self, request: &RouteRequest) -> bool {
        if let Some(ref task_type) = self.task_type {
            if request.task_type.as_deref() != Some(task_type.as_str()) {
                return false;
            }
        }
        if let Some(ref needle) = self.description_contains {
            if !request
                .description
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// Router-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Scoring objective
    pub mode: RoutingMode,
    /// Blend used when the mode is [`RoutingMode::Weighted`]
    pub weights: RoutingWeights,
    /// Boost local models
    pub prefer_local: bool,
    /// Provider family to boost
    pub preferred_provider: Option<ProviderKind>,
    /// Model id to boost
    pub preferred_model: Option<String>,
    /// Explicit overrides checked before scoring, in order
    pub rules: Vec<RoutingRule>,
    /// Per-provider circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,
    /// Spend limit settings
    pub budget: BudgetConfig,
    /// Retry schedule for transient backend failures
    pub retry: RetryPolicy,
    /// Models appended to the default catalog at construction
    pub extra_models: Vec<ModelConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: RoutingMode::Weighted,
            weights: RoutingWeights::default(),
            prefer_local: false,
            preferred_provider: None,
            preferred_model: None,
            rules: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            budget: BudgetConfig::default(),
            retry: RetryPolicy::default(),
            extra_models: Vec::new(),
        }
    }
}

impl RouterConfig {
    /// Check the knobs for internal consistency
    pub fn validate(&self) -> RouterResult<()> {
        if self.weights.cost < 0.0 || self.weights.latency < 0.0 || self.weights.quality < 0.0 {
            return Err(RouterError::invalid_config("weights must be non-negative"));
        }
        if matches!(self.mode, RoutingMode::Weighted)
            && self.weights.cost + self.weights.latency + self.weights.quality <= 0.0
        {
            return Err(RouterError::invalid_config(
                "weighted mode needs at least one positive weight",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(RouterError::invalid_config(
                "circuit_breaker.failure_threshold must be at least 1",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RouterError::invalid_config(
                "retry.max_attempts must be at least 1",
            ));
        }
        if let Some(limit) = self.budget.limit {
            if limit <= 0.0 {
                return Err(RouterError::invalid_config(
                    "budget.limit must be positive when set",
                ));
            }
        }
        Ok(())
    }
}

/// One routing query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Task type tag, matched by rules
    pub task_type: Option<String>,
    /// Free-text description, matched by rules
    pub description: String,
    /// Capabilities the model must advertise
    pub required_capabilities: Vec<Capability>,
    /// Exclude models above this blended per-1K cost
    pub max_cost_per_1k: Option<f64>,
    /// Exclude models above this nominal latency
    pub max_latency_ms: Option<u64>,
    /// Exclude models below this quality score
    pub min_quality: Option<f64>,
}

impl RouteRequest {
    /// Create a request with a description and no constraints
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Set the task type tag
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Require a capability
    pub fn require(mut self, capability: Capability) -> Self {
        self.required_capabilities.push(capability);
        self
    }

    /// Cap the blended per-1K cost
    pub fn with_max_cost_per_1k(mut self, dollars_per_1k: f64) -> Self {
        self.max_cost_per_1k = Some(dollars_per_1k);
        self
    }

    /// Cap the nominal latency
    pub fn with_max_latency_ms(mut self, latency_ms: u64) -> Self {
        self.max_latency_ms = Some(latency_ms);
        self
    }

    /// Require a minimum quality score
    pub fn with_min_quality(mut self, quality: f64) -> Self {
        self.min_quality = Some(quality);
        self
    }

    /// Whether a model passes every hard bound
    fn admits(&self, model: &ModelConfig) -> bool {
        if !model.has_capabilities(&self.required_capabilities) {
            return false;
        }
        if let Some(max) = self.max_cost_per_1k {
            if model.blended_cost_per_1k() > max {
                return false;
            }
        }
        if let Some(max) = self.max_latency_ms {
            if model.nominal_latency_ms > max {
                return false;
            }
        }
        if let Some(min) = self.min_quality {
            if model.quality < min {
                return false;
            }
        }
        true
    }
}

/// A runner-up from one routing decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteAlternative {
    pub model_id: String,
    pub score: f64,
}

/// Outcome of one routing decision
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Winning model
    pub model: ModelConfig,
    /// Winner's score under the configured mode
    pub score: f64,
    /// Up to three runners-up, best first; empty when a rule matched
    pub alternatives: Vec<RouteAlternative>,
    /// Rule that short-circuited scoring, if any
    pub matched_rule: Option<String>,
}

/// One completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Caller-assigned id, defaults to a fresh UUID
    pub id: String,
    /// Prompt sent to the model
    pub prompt: String,
    /// Output token ceiling
    pub max_tokens: u32,
    /// Exact model to use, skipping routing
    pub model_id: Option<String>,
    /// Routing constraints applied when no explicit model is set
    pub routing: RouteRequest,
}

impl CompletionRequest {
    /// Create a request whose routing description is its prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            routing: RouteRequest::new(prompt.clone()),
            prompt,
            max_tokens: 512,
            model_id: None,
        }
    }

    /// Set an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Pin the request to one catalog model
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Set the output token ceiling
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Replace the routing constraints
    pub fn with_routing(mut self, routing: RouteRequest) -> Self {
        self.routing = routing;
        self
    }
}

/// Outcome of one completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    /// Request this answers
    pub request_id: String,
    /// Model that produced (or last attempted) the completion
    pub model_id: String,
    /// Provider family serving the model
    pub provider: ProviderKind,
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
    pub completed_at: DateTime<Utc>,
}

/// Catalog-driven model router with circuit breakers and budget tracking
pub struct MultiModelRouter {
    config: RouterConfig,
    catalog: RwLock<Vec<ModelConfig>>,
    breaker: Mutex<CircuitBreaker>,
    budget: Mutex<BudgetTracker>,
    backend: SharedModelBackend,
    events: SharedRouterBus,
}

impl std::fmt::Debug for MultiModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiModelRouter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MultiModelRouter {
    /// Create a router over the default catalog with the simulated backend
    pub fn new(config: RouterConfig, events: SharedRouterBus) -> RouterResult<Self> {
        Self::with_backend(config, Arc::new(SimulatedBackend), events)
    }

    /// Create a router over the default catalog with an injected backend
    pub fn with_backend(
        config: RouterConfig,
        backend: SharedModelBackend,
        events: SharedRouterBus,
    ) -> RouterResult<Self> {
        let mut models = default_catalog();
        models.extend(config.extra_models.clone());
        Self::with_catalog(config, models, backend, events)
    }

    /// Create a router over an explicit catalog, defaults not included
    pub fn with_catalog(
        config: RouterConfig,
        models: Vec<ModelConfig>,
        backend: SharedModelBackend,
        events: SharedRouterBus,
    ) -> RouterResult<Self> {
        config.validate()?;
        let mut seen = std::collections::HashSet::new();
        for model in &models {
            model.validate().map_err(RouterError::invalid_config)?;
            if !seen.insert(model.id.clone()) {
                return Err(RouterError::DuplicateModel {
                    model_id: model.id.clone(),
                });
            }
        }
        Ok(Self {
            breaker: Mutex::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            budget: Mutex::new(BudgetTracker::new(config.budget.clone())),
            config,
            catalog: RwLock::new(models),
            backend,
            events,
        })
    }

    /// Wrap the router in an `Arc` for sharing
    pub fn shared(self) -> SharedMultiModelRouter {
        Arc::new(self)
    }

    /// Router configuration
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Event bus the router publishes on
    pub fn events(&self) -> &SharedRouterBus {
        &self.events
    }

    /// Snapshot of the catalog
    pub async fn models(&self) -> Vec<ModelConfig> {
        self.catalog.read().await.clone()
    }

    /// Add a model to the catalog at runtime
    pub async fn add_model(&self, model: ModelConfig) -> RouterResult<()> {
        model.validate().map_err(RouterError::invalid_config)?;
        let mut catalog = self.catalog.write().await;
        if catalog.iter().any(|m| m.id == model.id) {
            return Err(RouterError::DuplicateModel { model_id: model.id });
        }
        info!(model_id = %model.id, provider = %model.provider, "model added to catalog");
        catalog.push(model);
        Ok(())
    }

    /// Health observed for one provider family, if it has served traffic
    pub fn provider_health(&self, provider: ProviderKind) -> RouterResult<Option<ProviderHealth>> {
        Ok(self
            .breaker
            .lock()
            .map_err(|_| RouterError::LockPoisoned)?
            .health(provider)
            .cloned())
    }

    /// Current budget view
    pub fn budget(&self) -> RouterResult<BudgetSnapshot> {
        Ok(self
            .budget
            .lock()
            .map_err(|_| RouterError::LockPoisoned)?
            .snapshot())
    }

    /// Pick the best model for a request
    ///
    /// Hard bounds and capability requirements exclude candidates outright,
    /// open circuits hide their provider's models, rules short-circuit
    /// scoring, and the rest is ranked under the configured mode. Ties keep
    /// catalog order.
    pub async fn route(&self, request: &RouteRequest) -> RouterResult<RouteDecision> {
        let catalog = self.catalog.read().await;

        let admitted: Vec<&ModelConfig> =
            catalog.iter().filter(|m| request.admits(m)).collect();
        if admitted.is_empty() {
            return Err(RouterError::NoEligibleModel {
                reason: format!(
                    "all {} catalog models violate the request constraints",
                    catalog.len()
                ),
            });
        }

        let candidates: Vec<&ModelConfig> = {
            let mut breaker = self.breaker.lock().map_err(|_| RouterError::LockPoisoned)?;
            admitted
                .into_iter()
                .filter(|m| self.circuit_allows(&mut breaker, m.provider))
                .collect()
        };
        if candidates.is_empty() {
            return Err(RouterError::NoEligibleModel {
                reason: "every eligible provider's circuit is open".to_string(),
            });
        }

        // Rules win before any scoring.
        for rule in &self.config.rules {
            if !rule.matches(request) {
                continue;
            }
            if let Some(model) = candidates.iter().find(|m| m.id == rule.target_model) {
                let decision = RouteDecision {
                    model: (*model).clone(),
                    score: self.score_model(model),
                    alternatives: Vec::new(),
                    matched_rule: Some(rule.name.clone()),
                };
                debug!(model_id = %decision.model.id, rule = %rule.name, "routing rule matched");
                self.publish_routed(&decision);
                return Ok(decision);
            }
        }

        let mut scored: Vec<(f64, &ModelConfig)> = candidates
            .iter()
            .map(|m| (self.score_model(m), *m))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let (score, winner) = scored[0];
        let alternatives = scored
            .iter()
            .skip(1)
            .take(MAX_ALTERNATIVES)
            .map(|(s, m)| RouteAlternative {
                model_id: m.id.clone(),
                score: *s,
            })
            .collect();
        let decision = RouteDecision {
            model: winner.clone(),
            score,
            alternatives,
            matched_rule: None,
        };
        debug!(model_id = %decision.model.id, score, mode = %self.config.mode, "model routed");
        self.publish_routed(&decision);
        Ok(decision)
    }

    /// Execute a completion against the routed or explicitly named model
    ///
    /// Refuses while the target provider's circuit is open. Transient
    /// backend failures are retried on the configured schedule; exhaustion
    /// surfaces as a `success: false` result, never an `Err`. Success feeds
    /// provider health and the budget tracker; terminal failure feeds the
    /// circuit breaker.
    pub async fn complete(&self, request: &CompletionRequest) -> RouterResult<CompletionResult> {
        if request.id.trim().is_empty() {
            return Err(RouterError::invalid_config("request id must not be empty"));
        }

        let model = match &request.model_id {
            Some(model_id) => {
                let catalog = self.catalog.read().await;
                catalog
                    .iter()
                    .find(|m| &m.id == model_id)
                    .cloned()
                    .ok_or_else(|| RouterError::UnknownModel {
                        model_id: model_id.clone(),
                    })?
            }
            None => self.route(&request.routing).await?.model,
        };

        // Routing already skipped open circuits; the explicit-model path
        // still needs the refusal, and a circuit can trip in between.
        {
            let mut breaker = self.breaker.lock().map_err(|_| RouterError::LockPoisoned)?;
            if !self.circuit_allows(&mut breaker, model.provider) {
                return Err(RouterError::CircuitOpen {
                    provider: model.provider.to_string(),
                    resets_in_ms: breaker.resets_in_ms(model.provider),
                });
            }
        }

        let backend_request = BackendRequest {
            provider_id: model.provider.to_string(),
            model_id: model.id.clone(),
            prompt: request.prompt.clone(),
            max_tokens: request.max_tokens,
            nominal_latency_ms: model.nominal_latency_ms,
        };

        let mut last_error = String::new();
        for attempt in 1..=self.config.retry.max_attempts {
            match self.backend.complete(&backend_request).await {
                Ok(resp) => {
                    let cost = resp.input_tokens as f64 / 1000.0 * model.input_cost_per_1k
                        + resp.output_tokens as f64 / 1000.0 * model.output_cost_per_1k;
                    self.record_success(&model, resp.latency_ms, cost)?;
                    return Ok(CompletionResult {
                        request_id: request.id.clone(),
                        model_id: model.id.clone(),
                        provider: model.provider,
                        success: true,
                        content: Some(resp.content),
                        error: None,
                        input_tokens: resp.input_tokens,
                        output_tokens: resp.output_tokens,
                        latency_ms: resp.latency_ms,
                        cost,
                        completed_at: Utc::now(),
                    });
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(model_id = %model.id, attempt, error = %last_error, "completion attempt failed");
                    if attempt < self.config.retry.max_attempts {
                        let delay = self.config.retry.backoff_ms(attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        self.record_failure(&model)?;
        Ok(CompletionResult {
            request_id: request.id.clone(),
            model_id: model.id.clone(),
            provider: model.provider,
            success: false,
            content: None,
            error: Some(last_error),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            cost: 0.0,
            completed_at: Utc::now(),
        })
    }

    /// Whether the provider's circuit admits traffic, publishing the
    /// half-close transition when a cooldown just elapsed
    fn circuit_allows(&self, breaker: &mut CircuitBreaker, provider: ProviderKind) -> bool {
        match breaker.probe(provider) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                info!(provider = %provider, "circuit half-closed, provider degraded");
                self.events.publish(RouterEvent::CircuitClosed {
                    provider_id: provider.to_string(),
                    timestamp: Utc::now(),
                });
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Score one model under the configured mode, multipliers applied
    fn score_model(&self, model: &ModelConfig) -> f64 {
        let cost_score = (1.0 - model.blended_cost_per_1k() / COST_CEILING_PER_1K).max(0.0);
        let latency_score = (1.0 - model.nominal_latency_ms as f64 / LATENCY_CEILING_MS).max(0.0);
        let base = match self.config.mode {
            RoutingMode::CostOptimized => cost_score,
            RoutingMode::PerformanceOptimized => latency_score,
            RoutingMode::QualityOptimized => model.quality,
            RoutingMode::Weighted => {
                let w = &self.config.weights;
                w.cost * cost_score + w.latency * latency_score + w.quality * model.quality
            }
        };

        let mut score = base;
        if self.config.prefer_local && model.local {
            score *= LOCAL_MULTIPLIER;
        }
        if self.config.preferred_provider == Some(model.provider) {
            score *= PREFERRED_PROVIDER_MULTIPLIER;
        }
        if self.config.preferred_model.as_deref() == Some(model.id.as_str()) {
            score *= PREFERRED_MODEL_MULTIPLIER;
        }
        score
    }

    fn publish_routed(&self, decision: &RouteDecision) {
        self.events.publish(RouterEvent::ModelRouted {
            model_id: decision.model.id.clone(),
            mode: self.config.mode.to_string(),
            score: decision.score,
            timestamp: Utc::now(),
        });
    }

    fn record_success(&self, model: &ModelConfig, latency_ms: u64, cost: f64) -> RouterResult<()> {
        self.breaker
            .lock()
            .map_err(|_| RouterError::LockPoisoned)?
            .record_success(model.provider, latency_ms);

        let (crossings, spent) = {
            let mut budget = self.budget.lock().map_err(|_| RouterError::LockPoisoned)?;
            let crossings = budget.record(cost);
            (crossings, budget.snapshot().spent)
        };
        if let Some(limit) = self.config.budget.limit {
            if crossings.warning {
                warn!(spent, limit, "budget warning threshold crossed");
                self.events.publish(RouterEvent::BudgetWarning {
                    spent,
                    limit,
                    timestamp: Utc::now(),
                });
            }
            if crossings.exceeded {
                warn!(spent, limit, "budget limit exceeded");
                self.events.publish(RouterEvent::BudgetExceeded {
                    spent,
                    limit,
                    timestamp: Utc::now(),
                });
            }
        }
        Ok(())
    }

    fn record_failure(&self, model: &ModelConfig) -> RouterResult<()> {
        let mut breaker = self.breaker.lock().map_err(|_| RouterError::LockPoisoned)?;
        if breaker.record_failure(model.provider) {
            let failures = breaker.failure_count(model.provider);
            warn!(provider = %model.provider, failures, "circuit opened");
            self.events.publish(RouterEvent::CircuitOpened {
                provider_id: model.provider.to_string(),
                failures,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }
}
