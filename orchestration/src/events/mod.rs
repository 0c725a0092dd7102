//! Event-driven diagnostics for workers and the pool
//!
//! This module provides the pub/sub surface every other module reports
//! through.
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): the [`SwarmEvent`] enum covering worker
//!    lifecycle, task execution, pool membership, scaling, health, and
//!    checkpointing.
//!
//! 2. **Event Bus** (`bus.rs`): Tokio broadcast-based pub/sub with filtered
//!    subscriptions.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Workers /  │────▶│  Event Bus   │────▶│  Subscribers │
//! │   Pool       │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use swarm_pool::events::{EventBus, EventBusExt, EventFilter};
//!
//! let bus = EventBus::new().shared();
//! let mut failures = bus.subscribe_filtered(EventFilter::new().types(vec!["task_failed"]));
//!
//! // ... run tasks ...
//! let event = failures.recv().await?;
//! ```

pub mod bus;
pub mod types;

// Re-export core types
pub use bus::{EventBus, EventBusExt, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::{SwarmEvent, TerminationReason};
