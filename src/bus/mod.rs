//! Event system for agent lifecycle facts.
//!
//! The event bus provides:
//! - Typed publish-subscribe keyed by [`EventKind`]
//! - Optional buffering with size- and timer-triggered flushes
//! - A bounded history ring and running delivery metrics
//!
//! # Architecture
//!
//! Events flow from the session tracker → EventBus → subscribers:
//! - `EventBus`: dispatches to handlers, isolating handler failures
//! - `EventPersistenceConsumer` (in `persistence`) subscribes to every kind
//!   and writes events to storage off the caller's path

mod event_bus;
mod event_types;


pub use event_bus::{BusMetrics, EventBus, HandlerError, HandlerResult, SubscriptionId};
pub use event_types::{AgentEvent, EventKind, EventPayload};
