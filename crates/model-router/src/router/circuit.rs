//! Per-provider circuit breakers and rolling health
//!
//! The router tracks one [`ProviderHealth`] per provider family. Failures
//! increment a consecutive counter; at the configured threshold the
//! provider's condition flips to unhealthy and the circuit opens, failing
//! calls fast until the reset timeout elapses. The first probe after the
//! cooldown half-closes the circuit: condition degrades, the counter
//! resets, and execution is attempted again. Successes feed a latency EMA
//! and nudge the success rate back toward healthy.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::provider::ProviderKind;

/// Weight of the newest sample in the latency EMA
const LATENCY_EMA_ALPHA: f64 = 0.3;
/// Fraction of the remaining gap one outcome moves the success rate
const SUCCESS_RATE_NUDGE: f64 = 0.1;
/// Success rate at which a degraded provider counts as healthy again
const HEALTHY_ABOVE: f64 = 0.9;

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit refuses calls
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

/// Observed condition of one provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderCondition {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for ProviderCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderCondition::Healthy => write!(f, "healthy"),
            ProviderCondition::Degraded => write!(f, "degraded"),
            ProviderCondition::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Rolling health the router keeps per provider family
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    /// Current condition
    pub condition: ProviderCondition,
    /// Failures since the last success or half-close
    pub consecutive_failures: u32,
    /// Exponential moving average over successful calls
    pub avg_latency_ms: f64,
    /// Nudged success fraction in [0, 1]
    pub success_rate: f64,
    /// When the circuit opened, while it is open
    opened_at: Option<Instant>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            condition: ProviderCondition::Healthy,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            success_rate: 1.0,
            opened_at: None,
        }
    }
}

/// What a circuit probe observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests allowed
    Closed,
    /// Failing fast until the reset timeout elapses
    Open,
    /// Cooldown elapsed on this probe; the provider is degraded and the
    /// next request goes through
    HalfOpen,
}

/// Per-provider circuit breaker
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    health: HashMap<ProviderKind, ProviderHealth>,
}

impl CircuitBreaker {
    /// Create a breaker with every provider healthy
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            health: HashMap::new(),
        }
    }

    /// Current state for a provider, half-closing an open circuit whose
    /// cooldown has elapsed
    pub fn probe(&mut self, provider: ProviderKind) -> CircuitState {
        let reset = Duration::from_millis(self.config.reset_timeout_ms);
        let entry = self.health.entry(provider).or_insert_with(ProviderHealth::new);
        if entry.condition != ProviderCondition::Unhealthy {
            return CircuitState::Closed;
        }
        match entry.opened_at {
            Some(opened) if opened.elapsed() < reset => CircuitState::Open,
            _ => {
                entry.condition = ProviderCondition::Degraded;
                entry.consecutive_failures = 0;
                entry.opened_at = None;
                CircuitState::HalfOpen
            }
        }
    }

    /// Whether calls to the provider should be refused right now
    pub fn is_open(&mut self, provider: ProviderKind) -> bool {
        self.probe(provider) == CircuitState::Open
    }

    /// Milliseconds until an open circuit half-closes, zero when not open
    pub fn resets_in_ms(&self, provider: ProviderKind) -> u64 {
        let Some(entry) = self.health.get(&provider) else {
            return 0;
        };
        match entry.opened_at {
            Some(opened) if entry.condition == ProviderCondition::Unhealthy => {
                Duration::from_millis(self.config.reset_timeout_ms)
                    .saturating_sub(opened.elapsed())
                    .as_millis() as u64
            }
            _ => 0,
        }
    }

    /// Record a successful call
    ///
    /// Resets the failure counter, folds the latency into the EMA, nudges
    /// the success rate toward 1, and promotes a degraded provider back to
    /// healthy once the rate clears the recovery bar.
    pub fn record_success(&mut self, provider: ProviderKind, latency_ms: u64) {
        let entry = self.health.entry(provider).or_insert_with(ProviderHealth::new);
        entry.consecutive_failures = 0;
        entry.avg_latency_ms = if entry.avg_latency_ms == 0.0 {
            latency_ms as f64
        } else {
            entry.avg_latency_ms * (1.0 - LATENCY_EMA_ALPHA) + latency_ms as f64 * LATENCY_EMA_ALPHA
        };
        entry.success_rate += (1.0 - entry.success_rate) * SUCCESS_RATE_NUDGE;
        if entry.condition == ProviderCondition::Degraded && entry.success_rate >= HEALTHY_ABOVE {
            entry.condition = ProviderCondition::Healthy;
        }
    }

    /// Record a failed call; returns true when this failure tripped the
    /// circuit open
    pub fn record_failure(&mut self, provider: ProviderKind) -> bool {
        let entry = self.health.entry(provider).or_insert_with(ProviderHealth::new);
        entry.consecutive_failures += 1;
        entry.success_rate -= entry.success_rate * SUCCESS_RATE_NUDGE;
        if entry.condition != ProviderCondition::Unhealthy
            && entry.consecutive_failures >= self.config.failure_threshold
        {
            entry.condition = ProviderCondition::Unhealthy;
            entry.opened_at = Some(Instant::now());
            return true;
        }
        false
    }

    /// Health snapshot for one provider, if it has been seen
    pub fn health(&self, provider: ProviderKind) -> Option<&ProviderHealth> {
        self.health.get(&provider)
    }

    /// Failures recorded since the last success or half-close
    pub fn failure_count(&self, provider: ProviderKind) -> u32 {
        self.health
            .get(&provider)
            .map(|h| h.consecutive_failures)
            .unwrap_or(0)
    }
}
