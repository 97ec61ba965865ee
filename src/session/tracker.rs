use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use super::analytics::SessionAnalytics;
use super::snapshot::SessionSnapshot;
use crate::bus::{AgentEvent, EventBus, EventPayload};
use crate::config::TrackerConfig;
use crate::core::{
    AgentSessionRecord, CostUpdate, ErrorReport, FileOperation, PhaseTransition, ProgressUpdate,
    SessionResult, SessionStartOptions, SessionStatus, ToolExecution, ValidationReport,
};
use crate::persistence::persist_event;
use crate::scheduler::{spawn_detached, DelayedTask, RecurringTask};
use crate::storage::StorageCollaborator;

const MAX_HEALTHY_FAILURE_RATE: f64 = 0.10;

struct TrackedSession {
    snapshot: SessionSnapshot,
    analytics: SessionAnalytics,
    auto_save: Option<RecurringTask>,
    purge: Option<DelayedTask>,
}

/// A session record tagged with the snapshot revision it was taken at.
struct SessionWrite {
    revision: u64,
    record: AgentSessionRecord,
}

impl SessionWrite {
    fn of(snapshot: &SessionSnapshot) -> Self {
        Self {
            revision: snapshot.revision,
            record: snapshot.to_record(),
        }
    }
}

/// Latest unsaved state of a session and how many updates were folded into it.
struct PendingUpdate {
    write: SessionWrite,
    updates: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerHealth {
    pub healthy: bool,
    pub active_sessions: usize,
    pub tracked_sessions: usize,
    pub pending_updates: usize,
    pub persist_attempts: u64,
    pub persist_failures: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Bus,
    Direct,
    Skip,
}

struct TrackerInner {
    config: TrackerConfig,
    bus: Option<EventBus>,
    storage: Arc<dyn StorageCollaborator>,
    sessions: Mutex<HashMap<String, TrackedSession>>,
    pending: Mutex<HashMap<String, PendingUpdate>>,
    flush_timer: Mutex<Option<RecurringTask>>,
    revision: AtomicU64,
    /// Per-session revision of the last record written. Record writes for a
    /// session run one at a time under this lock and older revisions are dropped.
    write_gates: Mutex<HashMap<String, Arc<AsyncMutex<u64>>>>,
    persist_attempts: AtomicU64,
    persist_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl TrackerInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, TrackedSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingUpdate>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn write_gate(&self, session_id: &str) -> Arc<AsyncMutex<u64>> {
        self.write_gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    fn delivery(&self, high_value: bool) -> Delivery {
        match (&self.bus, high_value) {
            (None, _) => Delivery::Direct,
            (Some(_), true) if self.config.direct_high_value_writes => Delivery::Direct,
            (Some(_), _) if self.config.emit_events => Delivery::Bus,
            (Some(_), true) => Delivery::Direct,
            (Some(_), false) => Delivery::Skip,
        }
    }

    fn active_write(&self, session_id: &str) -> Option<SessionWrite> {
        self.sessions()
            .get(session_id)
            .filter(|s| s.snapshot.is_active())
            .map(|s| SessionWrite::of(&s.snapshot))
    }

    fn take_pending(&self, session_id: &str) -> Option<SessionWrite> {
        self.pending().remove(session_id).map(|p| p.write)
    }

    fn purge(&self, session_id: &str) {
        let mut sessions = self.sessions();
        if sessions
            .get(session_id)
            .is_some_and(|s| !s.snapshot.is_active())
        {
            sessions.remove(session_id);
            self.write_gates
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(session_id);
            tracing::debug!("purged finished session {session_id}");
        }
    }

    fn note_failure(&self, message: String) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message);
        }
    }

    /// Write a session record unless a newer revision of the same session
    /// has already been written. Returns false only on a failed write.
    async fn save_record(&self, write: &SessionWrite) -> bool {
        if !self.storage.is_enabled() {
            return false;
        }
        let record = &write.record;
        let gate = self.write_gate(&record.session_id);
        let mut last_written = gate.lock().await;
        if write.revision < *last_written {
            tracing::debug!(
                "dropping stale save of session {} (revision {} < {})",
                record.session_id,
                write.revision,
                *last_written
            );
            return true;
        }
        self.persist_attempts.fetch_add(1, Ordering::Relaxed);
        match self.storage.save_agent_session(record).await {
            Ok(response) => {
                *last_written = write.revision;
                tracing::debug!(
                    "saved session {} ({}, {}ms)",
                    record.session_id,
                    record.status,
                    response.execution_time_ms
                );
                true
            }
            Err(e) => {
                tracing::warn!("failed to save session {}: {e}", record.session_id);
                self.note_failure(e.to_string());
                false
            }
        }
    }

    async fn write_event(&self, event: &AgentEvent) {
        if !self.storage.is_enabled() {
            return;
        }
        self.persist_attempts.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = persist_event(event, self.storage.as_ref()).await {
            tracing::warn!(
                "failed to write {} event for session {}: {e}",
                event.kind,
                event.session_id
            );
            self.note_failure(e.to_string());
        }
    }

    async fn flush_pending(&self) -> usize {
        let drained: Vec<SessionWrite> = self.pending().drain().map(|(_, p)| p.write).collect();
        if drained.is_empty() {
            return 0;
        }
        let saves = drained.iter().map(|write| self.save_record(write));
        let saved = join_all(saves).await.into_iter().filter(|ok| *ok).count();
        tracing::debug!("flushed {saved}/{} buffered session updates", drained.len());
        saved
    }
}

/// Lifecycle tracking for agent sessions.
///
/// Every `track_*` call updates the in-memory snapshot and analytics
/// synchronously and never fails; persistence happens in the background
/// either through the event bus or by writing to storage directly. Calls for
/// sessions that are unknown or already finished are ignored.
///
/// Background writes and timers need a tokio runtime. Without one the
/// tracker still keeps in-memory state and `flush_*` can be awaited later.
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

impl SessionTracker {
    pub fn new(
        bus: Option<EventBus>,
        storage: Arc<dyn StorageCollaborator>,
        config: TrackerConfig,
    ) -> Self {
        let inner = Arc::new(TrackerInner {
            config,
            bus,
            storage,
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            flush_timer: Mutex::new(None),
            revision: AtomicU64::new(0),
            write_gates: Mutex::new(HashMap::new()),
            persist_attempts: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
        });

        if inner.config.buffer_updates {
            let weak: Weak<TrackerInner> = Arc::downgrade(&inner);
            let timer = RecurringTask::spawn("tracker-flush", inner.config.flush_interval(), move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => {
                            inner.flush_pending().await;
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

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn track_session_start(&self, session_id: &str, options: SessionStartOptions) {
        if session_id.trim().is_empty() {
            tracing::warn!("ignoring session start without an id");
            return;
        }

        let auto_save = if self.inner.config.enable_auto_save {
            self.spawn_auto_save(session_id)
        } else {
            None
        };

        let (write, event) = {
            let mut sessions = self.inner.sessions();
            if sessions.get(session_id).is_some_and(|s| s.snapshot.is_active()) {
                tracing::debug!("session {session_id} already active; start ignored");
                return;
            }
            let mut snapshot = SessionSnapshot::new(session_id, options.clone());
            snapshot.touch(self.inner.next_revision());
            let write = SessionWrite::of(&snapshot);
            let event = AgentEvent::new(
                session_id,
                snapshot.conversation_id.clone(),
                EventPayload::SessionStarted { options },
            );
            sessions.insert(
                session_id.to_string(),
                TrackedSession {
                    snapshot,
                    analytics: SessionAnalytics::default(),
                    auto_save,
                    purge: None,
                },
            );
            (write, event)
        };
        self.inner.take_pending(session_id);
        tracing::info!("tracking session {session_id}");

        match self.emitting_bus() {
            Some(bus) => {
                let event = bus.publish(event);
                self.remember(session_id, event);
            }
            None => {
                self.remember(session_id, event);
                let inner = self.inner.clone();
                spawn_detached("session start save", async move {
                    inner.save_record(&write).await;
                });
            }
        }
    }

    /// Fold counters into the snapshot. Progress is never delivered as an
    /// event; it reaches storage through the update buffer.
    pub fn track_session_progress(&self, session_id: &str, update: ProgressUpdate) {
        self.track(session_id, "progress", false, false, |s| {
            s.snapshot.metrics.apply_progress(&update);
            Some(EventPayload::SessionProgress(update))
        });
        self.queue_snapshot(session_id);
    }

    pub fn track_phase_transition(&self, session_id: &str, transition: PhaseTransition) {
        let enabled = self.inner.config.track_phases;
        self.track(session_id, "phase transition", enabled, true, |s| {
            s.snapshot.metrics.current_phase = transition.to;
            s.snapshot.metrics.phase_transitions.push(transition.clone());
            s.analytics.record_transition(&transition);
            Some(EventPayload::PhaseTransition(transition))
        });
    }

    pub fn track_tool_start(&self, session_id: &str, tool_name: &str, params: serde_json::Value) {
        let enabled = self.inner.config.track_tools;
        self.track(session_id, "tool start", enabled, false, |_| {
            Some(EventPayload::ToolExecutionStarted {
                tool_name: tool_name.to_string(),
                params,
            })
        });
    }

    pub fn track_tool_execution(&self, session_id: &str, execution: ToolExecution) {
        let enabled = self.inner.config.track_tools;
        self.track(session_id, "tool execution", enabled, true, |s| {
            s.snapshot.metrics.tool_call_count += 1;
            s.analytics.record_tool(&execution);
            Some(EventPayload::ToolExecutionCompleted(execution))
        });
    }

    pub fn track_file_operation(&self, session_id: &str, operation: FileOperation) {
        let enabled = self.inner.config.track_files;
        self.track(session_id, "file operation", enabled, false, |s| {
            s.snapshot.metrics.apply_file_operation(&operation);
            s.analytics.record_file(&operation);
            Some(EventPayload::FileOperation(operation))
        });
    }

    pub fn track_cost_update(&self, session_id: &str, update: CostUpdate) {
        let enabled = self.inner.config.track_costs;
        self.track(session_id, "cost update", enabled, false, |s| {
            let metrics = &mut s.snapshot.metrics;
            metrics.apply_cost(&update);
            let total_cost = metrics.total_cost;
            s.analytics
                .record_cost(Utc::now(), total_cost, metrics.tokens_used);
            Some(EventPayload::CostUpdate { update, total_cost })
        });
        self.queue_snapshot(session_id);
    }

    pub fn track_validation(&self, session_id: &str, report: ValidationReport) {
        self.track(session_id, "validation", true, false, |_| {
            Some(EventPayload::Validation(report))
        });
    }

    pub fn track_error(&self, session_id: &str, report: ErrorReport) {
        self.track(session_id, "error", true, false, |s| {
            s.snapshot.metrics.error_count += 1;
            Some(EventPayload::Error(report))
        });
    }

    /// Mark the session completed (or failed, per `result.success`), persist
    /// its final state and schedule its removal after the grace window.
    pub fn track_session_completion(&self, session_id: &str, result: SessionResult) {
        let status = if result.success {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        self.finish(session_id, status, result);
    }

    pub fn cancel_session(&self, session_id: &str) {
        self.finish(
            session_id,
            SessionStatus::Cancelled,
            SessionResult::failed("cancelled"),
        );
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Snapshot of a tracked session. Finished sessions stay readable until
    /// the grace window passes.
    pub fn active_session(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.inner
            .sessions()
            .get(session_id)
            .map(|s| s.snapshot.clone())
    }

    pub fn session_analytics(&self, session_id: &str) -> Option<SessionAnalytics> {
        self.inner
            .sessions()
            .get(session_id)
            .map(|s| s.analytics.clone())
    }

    pub fn active_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .sessions()
            .values()
            .filter(|s| s.snapshot.is_active())
            .map(|s| s.snapshot.session_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn health(&self) -> TrackerHealth {
        let (active_sessions, tracked_sessions) = {
            let sessions = self.inner.sessions();
            let active = sessions.values().filter(|s| s.snapshot.is_active()).count();
            (active, sessions.len())
        };
        let attempts = self.inner.persist_attempts.load(Ordering::Relaxed);
        let failures = self.inner.persist_failures.load(Ordering::Relaxed);
        let failure_rate = if attempts == 0 {
            0.0
        } else {
            failures as f64 / attempts as f64
        };
        TrackerHealth {
            healthy: failure_rate < MAX_HEALTHY_FAILURE_RATE,
            active_sessions,
            tracked_sessions,
            pending_updates: self.inner.pending().len(),
            persist_attempts: attempts,
            persist_failures: failures,
            last_error: self.inner.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health().healthy
    }

    // -----------------------------------------------------------------------
    // Flushing
    // -----------------------------------------------------------------------

    /// Persist the buffered state of one session, if any. Returns whether a
    /// write succeeded.
    pub async fn flush_session(&self, session_id: &str) -> bool {
        match self.inner.take_pending(session_id) {
            Some(write) => self.inner.save_record(&write).await,
            None => false,
        }
    }

    /// Persist every buffered session. Returns the number of successful writes.
    pub async fn flush_all(&self) -> usize {
        self.inner.flush_pending().await
    }

    /// Stop all timers and save the latest state of every active session.
    pub async fn shutdown(&self) {
        if let Ok(mut slot) = self.inner.flush_timer.lock() {
            if let Some(mut timer) = slot.take() {
                timer.cancel();
            }
        }

        let writes: Vec<SessionWrite> = {
            let mut sessions = self.inner.sessions();
            sessions
                .values_mut()
                .filter_map(|s| {
                    if let Some(mut timer) = s.auto_save.take() {
                        timer.cancel();
                    }
                    s.snapshot.is_active().then(|| SessionWrite::of(&s.snapshot))
                })
                .collect()
        };
        // Active snapshots supersede anything still buffered.
        self.inner.pending().clear();

        let saved = join_all(writes.iter().map(|w| self.inner.save_record(w)))
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        tracing::info!(
            "session tracker stopped ({saved}/{} active sessions saved)",
            writes.len()
        );
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn emitting_bus(&self) -> Option<&EventBus> {
        self.inner
            .bus
            .as_ref()
            .filter(|_| self.inner.config.emit_events)
    }

    /// Mutate an active session and deliver the event `mutate` returns.
    /// `enabled` gates delivery only; the snapshot is always updated.
    fn track<F>(&self, session_id: &str, what: &'static str, enabled: bool, high_value: bool, mutate: F)
    where
        F: FnOnce(&mut TrackedSession) -> Option<EventPayload>,
    {
        let event = {
            let mut sessions = self.inner.sessions();
            let Some(session) = sessions
                .get_mut(session_id)
                .filter(|s| s.snapshot.is_active())
            else {
                tracing::debug!("ignoring {what} for unknown or finished session {session_id}");
                return;
            };
            let payload = mutate(session);
            session.snapshot.touch(self.inner.next_revision());
            payload.map(|p| AgentEvent::new(session_id, session.snapshot.conversation_id.clone(), p))
        };

        let Some(event) = event else {
            return;
        };
        let event = if enabled {
            self.deliver(event, high_value)
        } else {
            event
        };
        self.remember(session_id, event);
    }

    fn deliver(&self, event: AgentEvent, high_value: bool) -> AgentEvent {
        match (self.inner.delivery(high_value), &self.inner.bus) {
            (Delivery::Bus, Some(bus)) => bus.publish(event),
            (Delivery::Direct, _) | (Delivery::Bus, None) => {
                let inner = self.inner.clone();
                let queued = event.clone();
                spawn_detached("direct event write", async move {
                    inner.write_event(&queued).await;
                });
                event
            }
            (Delivery::Skip, _) => event,
        }
    }

    fn remember(&self, session_id: &str, event: AgentEvent) {
        if let Some(session) = self.inner.sessions().get_mut(session_id) {
            session.snapshot.recent_events.push(event);
        }
    }

    /// Buffer the session's current state, or save it right away when
    /// buffering is off. A full buffer entry is saved immediately.
    fn queue_snapshot(&self, session_id: &str) {
        let Some(write) = self.inner.active_write(session_id) else {
            return;
        };

        let due = if self.inner.config.buffer_updates {
            let mut pending = self.inner.pending();
            let updates = pending.get(session_id).map_or(0, |p| p.updates) + 1;
            if updates >= self.inner.config.buffer_size.max(1) {
                pending.remove(session_id);
                Some(write)
            } else {
                pending.insert(session_id.to_string(), PendingUpdate { write, updates });
                None
            }
        } else {
            Some(write)
        };

        if let Some(write) = due {
            let inner = self.inner.clone();
            spawn_detached("session update save", async move {
                inner.save_record(&write).await;
            });
        }
    }

    fn spawn_auto_save(&self, session_id: &str) -> Option<RecurringTask> {
        let weak = Arc::downgrade(&self.inner);
        let id = session_id.to_string();
        RecurringTask::spawn("session-auto-save", self.inner.config.auto_save_interval(), move || {
            let weak = weak.clone();
            let id = id.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                let Some(write) = inner.active_write(&id) else {
                    return false;
                };
                // The saved snapshot already includes anything buffered.
                inner.take_pending(&id);
                inner.save_record(&write).await;
                true
            }
        })
    }

    fn finish(&self, session_id: &str, status: SessionStatus, result: SessionResult) {
        let weak = Arc::downgrade(&self.inner);
        let (write, event) = {
            let mut sessions = self.inner.sessions();
            let Some(session) = sessions
                .get_mut(session_id)
                .filter(|s| s.snapshot.is_active())
            else {
                tracing::debug!("ignoring {status} for unknown or finished session {session_id}");
                return;
            };
            if let Some(mut timer) = session.auto_save.take() {
                timer.cancel();
            }

            let snapshot = &mut session.snapshot;
            snapshot.touch(self.inner.next_revision());
            snapshot.status = status;
            snapshot.result = Some(result.clone());
            snapshot.completed_at = Some(snapshot.timestamp);

            let id = session_id.to_string();
            session.purge = DelayedTask::spawn(self.inner.config.completion_grace(), async move {
                if let Some(inner) = weak.upgrade() {
                    inner.purge(&id);
                }
            });

            let write = SessionWrite::of(snapshot);
            let event = AgentEvent::new(
                session_id,
                snapshot.conversation_id.clone(),
                EventPayload::SessionCompleted {
                    status,
                    result,
                    metrics: snapshot.metrics.clone(),
                    started_at: snapshot.started_at,
                    record_saved: true,
                },
            );
            (write, event)
        };

        // The final save below supersedes any buffered update.
        self.inner.take_pending(session_id);
        tracing::info!("session {session_id} finished: {status}");

        let inner = self.inner.clone();
        spawn_detached("final session save", async move {
            inner.save_record(&write).await;
        });

        let event = match self.emitting_bus() {
            Some(bus) => bus.publish(event),
            None => event,
        };
        self.remember(session_id, event);
    }
}
