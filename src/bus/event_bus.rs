use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::event_types::{AgentEvent, EventKind, EventPayload};
use crate::config::BusConfig;
use crate::core::RingBuffer;
use crate::scheduler::RecurringTask;

const MAX_HEALTHY_PROCESSING_MS: f64 = 100.0;
const MIN_HEALTHY_SUCCESS_RATE: f64 = 0.95;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&AgentEvent) -> HandlerResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(u64);

struct Listener {
    id: SubscriptionId,
    /// `None` listens to every kind.
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BusMetrics {
    pub total_published: u64,
    pub total_dispatched: u64,
    pub handler_invocations: u64,
    pub handler_errors: u64,
    pub events_by_kind: HashMap<EventKind, u64>,
    pub average_processing_time_ms: f64,
    pub success_rate: f64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub buffer_len: usize,
    pub listener_count: usize,
    pub history_len: usize,
}

struct BusState {
    listeners: Vec<Listener>,
    buffer: Vec<AgentEvent>,
    history: RingBuffer<AgentEvent>,
    metrics: BusMetrics,
    /// When the oldest event still in `buffer` arrived.
    buffered_since: Option<Instant>,
}

struct BusInner {
    config: BusConfig,
    seq: AtomicI64,
    next_subscription: AtomicU64,
    state: Mutex<BusState>,
    flush_timer: Mutex<Option<RecurringTask>>,
}

impl BusInner {
    fn state(&self) -> MutexGuard<'_, BusState> {
        // A handler panic never happens under this lock, so poisoning can only
        // come from a bug in the bus itself; keep serving rather than cascade.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process publish/subscribe hub for agent lifecycle events.
///
/// Cloning is cheap and every clone talks to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let history = RingBuffer::new(config.max_history_size);
        let inner = Arc::new(BusInner {
            seq: AtomicI64::new(0),
            next_subscription: AtomicU64::new(1),
            state: Mutex::new(BusState {
                listeners: Vec::new(),
                buffer: Vec::with_capacity(config.buffer_size.min(1024)),
                history,
                metrics: BusMetrics {
                    success_rate: 1.0,
                    ..Default::default()
                },
                buffered_since: None,
            }),
            flush_timer: Mutex::new(None),
            config,
        });

        if inner.config.enable_buffering {
            let weak: Weak<BusInner> = Arc::downgrade(&inner);
            let timer = RecurringTask::spawn("bus-flush", inner.config.flush_interval(), move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => {
                            EventBus { inner }.flush();
                            true
                        }
                        None => false,
                    }
                }
            });
            if let Ok(mut slot) = inner.flush_timer.lock() {
                *slot = timer;
            }
        }

        Self { inner }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Publish a pre-built event onto the bus.
    ///
    /// Immediate mode dispatches before returning. Buffered mode queues the
    /// event and dispatches when the buffer fills, the flush timer fires, or a
    /// critical event arrives (which drains the queue first to keep ordering).
    pub fn publish(&self, mut event: AgentEvent) -> AgentEvent {
        event.seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;

        let to_dispatch = {
            let mut state = self.inner.state();
            state.history.push(event.clone());
            state.metrics.total_published += 1;
            *state.metrics.events_by_kind.entry(event.kind).or_insert(0) += 1;
            state.metrics.last_event_at = Some(event.timestamp);

            if !self.inner.config.enable_buffering {
                vec![event.clone()]
            } else {
                state.buffer.push(event.clone());
                if event.kind.is_critical() || state.buffer.len() >= self.inner.config.buffer_size {
                    state.buffered_since = None;
                    std::mem::take(&mut state.buffer)
                } else {
                    state.buffered_since.get_or_insert_with(Instant::now);
                    Vec::new()
                }
            }
        };

        for queued in &to_dispatch {
            self.dispatch(queued);
        }
        event
    }

    /// Convenience: build and publish an event in one call.
    pub fn emit(
        &self,
        session_id: impl Into<String>,
        conversation_id: Option<String>,
        payload: EventPayload,
    ) -> AgentEvent {
        self.publish(AgentEvent::new(session_id, conversation_id, payload))
    }

    /// Dispatch everything currently buffered. No-op in immediate mode.
    pub fn flush(&self) -> usize {
        let drained = {
            let mut state = self.inner.state();
            state.buffered_since = None;
            std::mem::take(&mut state.buffer)
        };
        for event in &drained {
            self.dispatch(event);
        }
        if !drained.is_empty() {
            tracing::debug!("event bus flushed {} buffered events", drained.len());
        }
        drained.len()
    }

    /// Register a handler for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_listener(Some(kind), Arc::new(handler))
    }

    /// Register a handler for every event kind.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_listener(None, Arc::new(handler))
    }

    fn add_listener(&self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut state = self.inner.state();
        state.listeners.push(Listener { id, kind, handler });
        state.metrics.listener_count = state.listeners.len();
        id
    }

    /// Remove a handler. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.inner.state();
        let before = state.listeners.len();
        state.listeners.retain(|l| l.id != id);
        state.metrics.listener_count = state.listeners.len();
        state.listeners.len() != before
    }

    /// Oldest-first copy of the retained history.
    pub fn history(&self) -> Vec<AgentEvent> {
        self.inner.state().history.to_vec()
    }

    pub fn history_for_session(&self, session_id: &str) -> Vec<AgentEvent> {
        self.inner
            .state()
            .history
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn metrics(&self) -> BusMetrics {
        let state = self.inner.state();
        let mut metrics = state.metrics.clone();
        metrics.buffer_len = state.buffer.len();
        metrics.history_len = state.history.len();
        metrics
    }

    /// The buffer never sits at `buffer_size` (reaching it drains), so "stalled"
    /// means its oldest event has waited more than two flush intervals. That
    /// happens when the flush timer is not running, e.g. without a runtime.
    pub fn is_healthy(&self) -> bool {
        let state = self.inner.state();
        if state.metrics.success_rate < MIN_HEALTHY_SUCCESS_RATE {
            return false;
        }
        if state.metrics.average_processing_time_ms > MAX_HEALTHY_PROCESSING_MS {
            return false;
        }
        let limit = self.inner.config.flush_interval() * 2;
        let stalled = state
            .buffered_since
            .is_some_and(|since| since.elapsed() > limit);
        !stalled
    }

    /// Stop the flush timer and deliver anything still buffered.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.inner.flush_timer.lock() {
            if let Some(mut timer) = slot.take() {
                timer.cancel();
            }
        }
        let flushed = self.flush();
        tracing::info!("event bus shut down ({flushed} buffered events delivered)");
    }

    fn dispatch(&self, event: &AgentEvent) {
        let handlers: Vec<(SubscriptionId, Handler)> = {
            let state = self.inner.state();
            state
                .listeners
                .iter()
                .filter(|l| l.kind.map_or(true, |k| k == event.kind))
                .map(|l| (l.id, l.handler.clone()))
                .collect()
        };

        let started = Instant::now();
        let mut errors = 0u64;
        for (id, handler) in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    errors += 1;
                    tracing::warn!("handler {:?} failed on {} event {}: {e}", id, event.kind, event.id);
                }
                Err(_) => {
                    errors += 1;
                    tracing::error!("handler {:?} panicked on {} event {}", id, event.kind, event.id);
                }
            }
        }
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut state = self.inner.state();
        let metrics = &mut state.metrics;
        metrics.total_dispatched += 1;
        metrics.handler_invocations += handlers.len() as u64;
        metrics.handler_errors += errors;
        let n = metrics.total_dispatched as f64;
        metrics.average_processing_time_ms += (elapsed_ms - metrics.average_processing_time_ms) / n;
        metrics.success_rate = if metrics.handler_invocations == 0 {
            1.0
        } else {
            1.0 - metrics.handler_errors as f64 / metrics.handler_invocations as f64
        };
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
