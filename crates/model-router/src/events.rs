//! Typed event stream for provider and routing diagnostics
//!
//! Same pub/sub shape as the pool side: a bounded Tokio broadcast channel,
//! non-blocking publish, slow subscribers observe `Lagged` instead of
//! backpressuring the router.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Events published by the provider adapter and the model router
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterEvent {
    /// A provider joined the adapter registry
    ProviderRegistered {
        provider_id: String,
        kind: String,
        timestamp: DateTime<Utc>,
    },

    /// A provider left the adapter registry
    ProviderUnregistered {
        provider_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Selection scored the registry and picked a provider/model pair
    ProviderSelected {
        provider_id: String,
        model_id: String,
        score: f64,
        timestamp: DateTime<Utc>,
    },

    /// Routing picked a catalog model for a request
    ModelRouted {
        model_id: String,
        mode: String,
        score: f64,
        timestamp: DateTime<Utc>,
    },

    /// A completion was served from the response cache
    CacheHit {
        provider_id: String,
        task_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A provider hit its rate-limit window
    RateLimited {
        provider_id: String,
        resets_in_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A provider's observed health status changed
    HealthChanged {
        provider_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },

    /// A provider's circuit breaker tripped open
    CircuitOpened {
        provider_id: String,
        failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// A provider's circuit breaker left the open state
    CircuitClosed {
        provider_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Spend crossed 80% of the budget limit
    BudgetWarning {
        spent: f64,
        limit: f64,
        timestamp: DateTime<Utc>,
    },

    /// Spend crossed the budget limit
    BudgetExceeded {
        spent: f64,
        limit: f64,
        timestamp: DateTime<Utc>,
    },
}

impl RouterEvent {
    /// When the event occurred
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RouterEvent::ProviderRegistered { timestamp, .. }
            | RouterEvent::ProviderUnregistered { timestamp, .. }
            | RouterEvent::ProviderSelected { timestamp, .. }
            | RouterEvent::ModelRouted { timestamp, .. }
            | RouterEvent::CacheHit { timestamp, .. }
            | RouterEvent::RateLimited { timestamp, .. }
            | RouterEvent::HealthChanged { timestamp, .. }
            | RouterEvent::CircuitOpened { timestamp, .. }
            | RouterEvent::CircuitClosed { timestamp, .. }
            | RouterEvent::BudgetWarning { timestamp, .. }
            | RouterEvent::BudgetExceeded { timestamp, .. } => *timestamp,
        }
    }

    /// Event type as a string for logging and filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            RouterEvent::ProviderRegistered { .. } => "provider_registered",
            RouterEvent::ProviderUnregistered { .. } => "provider_unregistered",
            RouterEvent::ProviderSelected { .. } => "provider_selected",
            RouterEvent::ModelRouted { .. } => "model_routed",
            RouterEvent::CacheHit { .. } => "cache_hit",
            RouterEvent::RateLimited { .. } => "rate_limited",
            RouterEvent::HealthChanged { .. } => "health_changed",
            RouterEvent::CircuitOpened { .. } => "circuit_opened",
            RouterEvent::CircuitClosed { .. } => "circuit_closed",
            RouterEvent::BudgetWarning { .. } => "budget_warning",
            RouterEvent::BudgetExceeded { .. } => "budget_exceeded",
        }
    }

    /// Provider the event concerns, when there is one
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            RouterEvent::ProviderRegistered { provider_id, .. }
            | RouterEvent::ProviderUnregistered { provider_id, .. }
            | RouterEvent::ProviderSelected { provider_id, .. }
            | RouterEvent::CacheHit { provider_id, .. }
            | RouterEvent::RateLimited { provider_id, .. }
            | RouterEvent::HealthChanged { provider_id, .. }
            | RouterEvent::CircuitOpened { provider_id, .. }
            | RouterEvent::CircuitClosed { provider_id, .. } => Some(provider_id),
            _ => None,
        }
    }
}

/// Shared reference to a router event bus
pub type SharedRouterBus = Arc<RouterBus>;

/// Broadcast bus carrying [`RouterEvent`]s
pub struct RouterBus {
    sender: broadcast::Sender<RouterEvent>,
}

impl RouterBus {
    /// Create a new bus
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Wrap the bus in an `Arc` for sharing
    pub fn shared(self) -> SharedRouterBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: RouterEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "router event published"),
            Err(_) => debug!(event_type, "router event published (no receivers)"),
        }
    }

    /// Subscribe to the raw event stream
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events concerning one provider
    pub fn subscribe_provider(&self, provider_id: &str) -> ProviderEvents {
        ProviderEvents {
            receiver: self.subscribe(),
            provider_id: provider_id.to_string(),
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RouterBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that yields only events about one provider
pub struct ProviderEvents {
    receiver: broadcast::Receiver<RouterEvent>,
    provider_id: String,
}

impl ProviderEvents {
    /// Receive the next event for the subscribed provider
    pub async fn recv(&mut self) -> Result<RouterEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if event.provider_id() == Some(self.provider_id.as_str()) {
                return Ok(event);
            }
        }
    }
}
