use std::sync::{Arc, Mutex};
use std::time::Instant as StdInstant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::{tool_outcome, validate_event};
use crate::bus::{AgentEvent, EventBus, EventKind, EventPayload, HandlerError, SubscriptionId};
use crate::config::ConsumerConfig;
use crate::core::{AgentSessionRecord, SessionMetrics, SessionStatus};
use crate::storage::{StorageCollaborator, StorageError};

const MIN_HEALTHY_SUCCESS_RATE: f64 = 0.90;
const MAX_HEALTHY_PROCESSING_MS: f64 = 5_000.0;
const MAX_IDLE_AFTER_ACTIVITY_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    Normal,
    High,
}

impl From<EventKind> for EventPriority {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::SessionStarted | EventKind::SessionCompleted | EventKind::Error => Self::High,
            EventKind::PhaseTransition | EventKind::ToolExecutionCompleted | EventKind::Validation => {
                Self::Normal
            }
            EventKind::SessionProgress
            | EventKind::ToolExecutionStarted
            | EventKind::FileOperation
            | EventKind::CostUpdate => Self::Low,
        }
    }
}

/// Per-attempt bookkeeping. `retry_count` never exceeds `max_retries`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EventMetadata {
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: EventPriority,
}

impl EventMetadata {
    fn for_event(event: &AgentEvent, max_retries: u32) -> Self {
        Self {
            retry_count: 0,
            max_retries,
            priority: event.kind.into(),
        }
    }

    fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStats {
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub retried: u64,
    pub skipped: u64,
    pub average_processing_time_ms: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl ProcessingStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_processed == 0 {
            1.0
        } else {
            self.successful as f64 / self.total_processed as f64
        }
    }

    fn record(&mut self, succeeded: bool, elapsed_ms: f64) {
        self.total_processed += 1;
        if succeeded {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        let n = self.total_processed as f64;
        self.average_processing_time_ms += (elapsed_ms - self.average_processing_time_ms) / n;
        self.last_processed_at = Some(Utc::now());
    }
}

enum ConsumerMessage {
    Event(Box<AgentEvent>),
    Flush(oneshot::Sender<()>),
}

/// Subscribes to every event kind and writes events to storage on a
/// background worker, retrying transient failures with linear backoff.
///
/// Publishers never wait on storage and never see storage errors.
pub struct EventPersistenceConsumer {
    bus: EventBus,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    tx: mpsc::UnboundedSender<ConsumerMessage>,
    stats: Arc<Mutex<ProcessingStats>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventPersistenceConsumer {
    /// Subscribe to `bus` and spawn the worker. Must be called inside a tokio runtime.
    pub fn new(
        bus: &EventBus,
        storage: Arc<dyn StorageCollaborator>,
        config: ConsumerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(ProcessingStats::default()));

        let subscriptions = EventKind::all()
            .iter()
            .map(|kind| {
                let tx = tx.clone();
                bus.subscribe(*kind, move |event| {
                    tx.send(ConsumerMessage::Event(Box::new(event.clone())))
                        .map_err(|_| HandlerError::new("persistence worker has stopped"))
                })
            })
            .collect();

        let worker = tokio::spawn(run_worker(rx, storage, config, stats.clone()));
        tracing::info!("event persistence consumer started");

        Self {
            bus: bus.clone(),
            subscriptions: Mutex::new(subscriptions),
            tx,
            stats,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn processing_stats(&self) -> ProcessingStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_healthy(&self) -> bool {
        let stats = self.processing_stats();
        if stats.success_rate() < MIN_HEALTHY_SUCCESS_RATE {
            return false;
        }
        if stats.average_processing_time_ms > MAX_HEALTHY_PROCESSING_MS {
            return false;
        }
        match stats.last_processed_at {
            Some(last) => Utc::now() - last <= ChronoDuration::seconds(MAX_IDLE_AFTER_ACTIVITY_SECS),
            None => true,
        }
    }

    /// Wait until every event received so far has been processed, including
    /// any pending batch.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(ConsumerMessage::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Stop listening, drain what has been received, and stop the worker.
    pub async fn shutdown(&self) {
        let subscriptions = self
            .subscriptions
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default();
        for id in subscriptions {
            self.bus.unsubscribe(id);
        }
        self.flush().await;
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            worker.abort();
        }
        let stats = self.processing_stats();
        tracing::info!(
            "event persistence consumer stopped: {} processed, {} failed, {} skipped",
            stats.total_processed,
            stats.failed,
            stats.skipped
        );
    }
}

impl Drop for EventPersistenceConsumer {
    fn drop(&mut self) {
        if let Ok(subscriptions) = self.subscriptions.get_mut() {
            for id in subscriptions.drain(..) {
                self.bus.unsubscribe(id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<ConsumerMessage>,
    storage: Arc<dyn StorageCollaborator>,
    config: ConsumerConfig,
    stats: Arc<Mutex<ProcessingStats>>,
) {
    let batch_size = config.batch_size.max(1);
    let mut buffer: Vec<AgentEvent> = Vec::with_capacity(batch_size);
    let period = config.flush_interval().max(std::time::Duration::from_millis(1));
    let mut interval = time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(ConsumerMessage::Event(event)) => {
                        if config.enable_batching {
                            buffer.push(*event);
                            if buffer.len() >= batch_size {
                                flush_batch(&mut buffer, storage.as_ref(), &config, &stats).await;
                            }
                        } else {
                            process_event(&event, storage.as_ref(), &config, &stats).await;
                        }
                    }
                    Some(ConsumerMessage::Flush(done)) => {
                        flush_batch(&mut buffer, storage.as_ref(), &config, &stats).await;
                        let _ = done.send(());
                    }
                    None => {
                        flush_batch(&mut buffer, storage.as_ref(), &config, &stats).await;
                        break;
                    }
                }
            }
            _ = interval.tick(), if config.enable_batching => {
                flush_batch(&mut buffer, storage.as_ref(), &config, &stats).await;
            }
        }
    }
}

async fn flush_batch(
    buffer: &mut Vec<AgentEvent>,
    storage: &dyn StorageCollaborator,
    config: &ConsumerConfig,
    stats: &Mutex<ProcessingStats>,
) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    tracing::debug!("persisting batch of {} events", batch.len());
    // Each event gets its own retry budget; a poisoned event only costs its
    // own retries.
    for event in &batch {
        process_event(event, storage, config, stats).await;
    }
}

async fn process_event(
    event: &AgentEvent,
    storage: &dyn StorageCollaborator,
    config: &ConsumerConfig,
    stats: &Mutex<ProcessingStats>,
) {
    if !storage.is_enabled() {
        bump_skipped(stats);
        return;
    }

    let started = StdInstant::now();
    let outcome = match validate_event(event) {
        Ok(()) => persist_with_retry(event, storage, config, stats).await,
        Err(e) => Err(e),
    };
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Err(StorageError::Disabled) => bump_skipped(stats),
        Ok(()) => {
            if let Ok(mut s) = stats.lock() {
                s.record(true, elapsed_ms);
            }
            tracing::debug!("persisted {} event {} for {}", event.kind, event.id, event.session_id);
        }
        Err(e) => {
            if let Ok(mut s) = stats.lock() {
                s.record(false, elapsed_ms);
            }
            match EventPriority::from(event.kind) {
                EventPriority::High => tracing::error!(
                    "dropping {} event {} for {}: {e}",
                    event.kind,
                    event.id,
                    event.session_id
                ),
                EventPriority::Normal | EventPriority::Low => tracing::warn!(
                    "dropping {} event {} for {}: {e}",
                    event.kind,
                    event.id,
                    event.session_id
                ),
            }
        }
    }
}

async fn persist_with_retry(
    event: &AgentEvent,
    storage: &dyn StorageCollaborator,
    config: &ConsumerConfig,
    stats: &Mutex<ProcessingStats>,
) -> Result<(), StorageError> {
    let mut meta = EventMetadata::for_event(event, config.max_retries);
    loop {
        match persist_event(event, storage).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && meta.can_retry() => {
                meta.retry_count += 1;
                if let Ok(mut s) = stats.lock() {
                    s.retried += 1;
                }
                let delay = config.retry_delay(meta.retry_count);
                tracing::warn!(
                    "persisting {} event {} failed (attempt {}/{}), retrying in {:?}: {e}",
                    event.kind,
                    event.id,
                    meta.retry_count,
                    meta.max_retries + 1,
                    delay
                );
                time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Route an event to the storage call for its kind.
pub(crate) async fn persist_event(
    event: &AgentEvent,
    storage: &dyn StorageCollaborator,
) -> Result<(), StorageError> {
    match &event.payload {
        EventPayload::SessionStarted { options } => {
            let record = AgentSessionRecord {
                session_id: event.session_id.clone(),
                conversation_id: event
                    .conversation_id
                    .clone()
                    .or_else(|| options.conversation_id.clone()),
                status: SessionStatus::Active,
                metrics: SessionMetrics::default(),
                started_at: event.timestamp,
                updated_at: event.timestamp,
                completed_at: None,
            };
            // Insert-only: a retried start must not reset a record that has
            // since been saved with real metrics.
            let created = storage.create_agent_session(&record).await?;
            if !created.data {
                tracing::debug!("session {} already stored; start not re-applied", record.session_id);
            }
        }
        EventPayload::SessionCompleted {
            record_saved: true, ..
        } => {
            storage.record_event(event).await?;
        }
        EventPayload::SessionCompleted {
            status,
            metrics,
            started_at,
            ..
        } => {
            let record = AgentSessionRecord {
                session_id: event.session_id.clone(),
                conversation_id: event.conversation_id.clone(),
                status: *status,
                metrics: metrics.clone(),
                started_at: *started_at,
                updated_at: event.timestamp,
                completed_at: Some(event.timestamp),
            };
            storage.save_agent_session(&record).await?;
        }
        EventPayload::PhaseTransition(transition) => {
            storage
                .save_phase_transition(&event.session_id, transition)
                .await?;
        }
        EventPayload::ToolExecutionCompleted(execution) => {
            let outcome = tool_outcome(execution);
            storage
                .save_tool_execution(
                    &event.session_id,
                    &execution.tool_name,
                    &execution.params,
                    Some(&outcome),
                    execution.duration_ms,
                )
                .await?;
        }
        EventPayload::SessionProgress(_)
        | EventPayload::ToolExecutionStarted { .. }
        | EventPayload::FileOperation(_)
        | EventPayload::CostUpdate { .. }
        | EventPayload::Validation(_)
        | EventPayload::Error(_) => {
            storage.record_event(event).await?;
        }
    }
    Ok(())
}

fn bump_skipped(stats: &Mutex<ProcessingStats>) {
    if let Ok(mut s) = stats.lock() {
        s.skipped += 1;
    }
}
