//! Model Router Library
//!
//! This library provides:
//! - A provider registry with rate limits, health, and cost tracking
//! - A provider adapter with scored selection, caching, retry, and failover
//! - A multi-model router picking catalog models by cost, latency, quality,
//!   or a weighted blend, with rule overrides
//! - Per-provider circuit breakers and period-scoped budget tracking
//!
//! # Architecture
//!
//! ```text
//!                  +---------------------+
//!   Completion --> |  MultiModelRouter   | ----> RouterEvent bus
//!                  |  rules / scoring    |
//!                  |  circuit / budget   |
//!                  +----------+----------+
//!                             |
//!               +-------------+-------------+
//!               |                           |
//!        +------v-------+         +---------v-------+
//!        | ModelBackend |         | ProviderAdapter |
//!        |  (transport  |         |   (registry +   |
//!        |    seam)     |         |    failover)    |
//!        +--------------+         +-----------------+
//! ```
//!
//! The router never talks to a provider SDK directly: completions go through
//! the [`backend::ModelBackend`] seam so hosts plug in real transports, and a
//! simulated backend ships for development and tests. Provider-level concerns
//! (registration, rate limits, response caching, cross-provider failover)
//! live in [`provider::adapter::ProviderAdapter`]. Both sides publish
//! structured [`events::RouterEvent`]s on a broadcast bus instead of holding
//! callbacks.

pub mod backend;
pub mod events;
pub mod provider;
pub mod router;

// Re-export the backend seam
pub use backend::{
    BackendError, BackendRequest, BackendResponse, BackendResult, ModelBackend,
    SharedModelBackend, SimulatedBackend,
};

// Re-export key event types
pub use events::{ProviderEvents, RouterBus, RouterEvent, SharedRouterBus};

// Re-export provider registry types
pub use provider::{
    ModelConstraints, ModelSpec, Provider, ProviderKind, ProviderMetrics, ProviderStatus,
    RateLimitWindow,
};

// Re-export adapter types
pub use provider::adapter::{
    provider_score, AdapterConfig, AdapterStats, InferenceTask, ProviderAdapter, ProviderError,
    ProviderRequirements, ProviderResponse, ProviderResult, ProviderSelection, RetryPolicy,
    SharedProviderAdapter,
};

// Re-export cost tracking types
pub use provider::cost::{CostSnapshot, CostTracker};

// Re-export routing types
pub use router::{
    CompletionRequest, CompletionResult, MultiModelRouter, RouteAlternative, RouteDecision,
    RouteRequest, RouterConfig, RouterError, RouterResult, RoutingMode, RoutingRule,
    RoutingWeights, SharedMultiModelRouter,
};

// Re-export catalog types
pub use router::catalog::{default_catalog, Capability, ModelConfig};

// Re-export circuit breaker types
pub use router::circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ProviderCondition, ProviderHealth,
};

// Re-export budget types
pub use router::budget::{
    BudgetConfig, BudgetCrossings, BudgetPeriod, BudgetSnapshot, BudgetTracker,
};
