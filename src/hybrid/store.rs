use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;

use super::backend::{BackendKind, DatabaseBackend, FileBackend, StateBackend};
use super::HybridError;
use crate::config::HybridConfig;
use crate::core::ConversationState;
use crate::scheduler::RecurringTask;
use crate::storage::{StorageCollaborator, StorageError};

const MAX_HEALTHY_ERROR_RATE: f64 = 0.10;
/// Error rates over fewer operations than this are not judged.
const MIN_OPERATIONS_FOR_HEALTH: u64 = 10;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub state: ConversationState,
    pub cached_at: Instant,
}

impl CacheEntry {
    fn new(state: ConversationState) -> Self {
        Self {
            state,
            cached_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.cached_at.elapsed() > timeout
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendMetrics {
    pub reads: u64,
    pub writes: u64,
    pub errors: u64,
}

impl BackendMetrics {
    pub fn operations(&self) -> u64 {
        self.reads + self.writes
    }

    pub fn error_rate(&self) -> f64 {
        match self.operations() {
            0 => 0.0,
            ops => self.errors as f64 / ops as f64,
        }
    }

    fn is_healthy(&self) -> bool {
        self.operations() < MIN_OPERATIONS_FOR_HEALTH || self.error_rate() < MAX_HEALTHY_ERROR_RATE
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistenceMetrics {
    pub database: BackendMetrics,
    pub file: BackendMetrics,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl PersistenceMetrics {
    fn backend_mut(&mut self, kind: BackendKind) -> &mut BackendMetrics {
        match kind {
            BackendKind::Database => &mut self.database,
            BackendKind::File => &mut self.file,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub cache_evicted: usize,
    pub database_removed: u64,
    pub file_removed: u64,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Read,
    Write,
}

struct StoreInner {
    config: HybridConfig,
    database: Option<Arc<dyn StateBackend>>,
    file: Option<Arc<dyn StateBackend>>,
    cache: DashMap<String, CacheEntry>,
    metrics: Mutex<PersistenceMetrics>,
    cleanup_timer: Mutex<Option<RecurringTask>>,
}

impl StoreInner {
    fn metrics(&self) -> MutexGuard<'_, PersistenceMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn evict_expired(&self) -> usize {
        let timeout = self.config.cache_timeout();
        let before = self.cache.len();
        self.cache.retain(|_, entry| !entry.is_expired(timeout));
        let evicted = before.saturating_sub(self.cache.len());
        if evicted > 0 {
            tracing::debug!("evicted {evicted} expired conversation cache entries");
        }
        evicted
    }
}

/// Conversation state store with a TTL cache in front of a database backend
/// and a file backend.
///
/// The database is primary when enabled, available and preferred; otherwise
/// the file backend is. With fallback enabled a failing primary is backed by
/// the other backend, and with sync enabled every successful primary write or
/// read is replicated to the other backend on a best-effort basis.
pub struct HybridStateStore {
    inner: Arc<StoreInner>,
}

impl HybridStateStore {
    /// Build the usual pair of backends: the storage collaborator (when
    /// `enable_database` is set) and JSON files under `state_dir`.
    pub fn open(
        config: HybridConfig,
        storage: Arc<dyn StorageCollaborator>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        let database: Option<Arc<dyn StateBackend>> = if config.enable_database {
            Some(Arc::new(DatabaseBackend::new(storage)))
        } else {
            None
        };
        let file: Arc<dyn StateBackend> = Arc::new(FileBackend::new(state_dir));
        Self::with_backends(config, database, Some(file))
    }

    pub fn with_backends(
        config: HybridConfig,
        database: Option<Arc<dyn StateBackend>>,
        file: Option<Arc<dyn StateBackend>>,
    ) -> Self {
        tracing::info!(
            "hybrid state store ready (database: {}, file: {}, prefer database: {}, sync: {})",
            database.is_some(),
            file.is_some(),
            config.prefer_database,
            config.sync_between_sources
        );
        Self {
            inner: Arc::new(StoreInner {
                config,
                database,
                file,
                cache: DashMap::new(),
                metrics: Mutex::new(PersistenceMetrics::default()),
                cleanup_timer: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &HybridConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Backend selection
    // -----------------------------------------------------------------------

    fn backends(&self) -> (Option<&Arc<dyn StateBackend>>, Option<&Arc<dyn StateBackend>>) {
        let database = self.inner.database.as_ref().filter(|b| b.is_available());
        let file = self.inner.file.as_ref();
        if self.inner.config.prefer_database && database.is_some() {
            (database, file)
        } else {
            match file {
                Some(file) => (Some(file), database),
                None => (database, None),
            }
        }
    }

    fn fallback_enabled(&self) -> bool {
        self.inner.config.fallback_to_file
    }

    fn sync_enabled(&self) -> bool {
        self.inner.config.sync_between_sources
    }

    fn record(&self, kind: BackendKind, op: Op, ok: bool) {
        let mut metrics = self.inner.metrics();
        let backend = metrics.backend_mut(kind);
        match op {
            Op::Read => backend.reads += 1,
            Op::Write => backend.writes += 1,
        }
        if !ok {
            backend.errors += 1;
        }
    }

    async fn save_to(&self, backend: &dyn StateBackend, state: &ConversationState) -> Result<(), StorageError> {
        let result = backend.save(state).await;
        self.record(backend.kind(), Op::Write, result.is_ok());
        result
    }

    async fn load_from(
        &self,
        backend: &dyn StateBackend,
        id: &str,
    ) -> Result<Option<ConversationState>, StorageError> {
        let result = backend.load(id).await;
        self.record(backend.kind(), Op::Read, result.is_ok());
        result
    }

    /// Best-effort copy to another backend.
    async fn replicate(&self, target: &dyn StateBackend, state: &ConversationState) {
        match self.save_to(target, state).await {
            Ok(()) => {
                self.inner.metrics().last_sync_at = Some(Utc::now());
                tracing::debug!("synced conversation {} to {} backend", state.id, target.kind());
            }
            Err(e) => tracing::warn!(
                "failed to sync conversation {} to {} backend: {e}",
                state.id,
                target.kind()
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Save through the cache to the primary backend, falling back to the
    /// secondary. Returns the backend that accepted the write.
    pub async fn save(&self, state: &ConversationState) -> Result<BackendKind, HybridError> {
        if state.id.trim().is_empty() {
            return Err(HybridError::InvalidId);
        }
        self.inner
            .cache
            .insert(state.id.clone(), CacheEntry::new(state.clone()));

        let (primary, secondary) = self.backends();
        let Some(primary) = primary else {
            self.inner.cache.remove(&state.id);
            return Err(HybridError::NoBackend);
        };

        let primary_err = match self.save_to(primary.as_ref(), state).await {
            Ok(()) => {
                if let (true, Some(secondary)) = (self.sync_enabled(), secondary) {
                    self.replicate(secondary.as_ref(), state).await;
                }
                return Ok(primary.kind());
            }
            Err(e) => e,
        };
        tracing::warn!(
            "saving conversation {} to {} backend failed: {primary_err}",
            state.id,
            primary.kind()
        );

        let secondary = match secondary {
            Some(secondary) if self.fallback_enabled() => secondary,
            _ => {
                self.inner.cache.remove(&state.id);
                return Err(HybridError::Backend {
                    kind: primary.kind(),
                    source: primary_err,
                });
            }
        };
        match self.save_to(secondary.as_ref(), state).await {
            Ok(()) => {
                tracing::info!(
                    "conversation {} saved to fallback {} backend",
                    state.id,
                    secondary.kind()
                );
                Ok(secondary.kind())
            }
            Err(secondary_err) => {
                self.inner.cache.remove(&state.id);
                tracing::error!(
                    "conversation {} could not be saved to any backend: {secondary_err}",
                    state.id
                );
                Err(HybridError::Exhausted {
                    primary_kind: primary.kind(),
                    primary: primary_err,
                    secondary_kind: secondary.kind(),
                    secondary: secondary_err,
                })
            }
        }
    }

    /// Load from the cache, then the primary, then (with fallback) the
    /// secondary backend.
    pub async fn load(&self, id: &str) -> Result<Option<ConversationState>, HybridError> {
        if id.trim().is_empty() {
            return Err(HybridError::InvalidId);
        }

        let timeout = self.inner.config.cache_timeout();
        let cached = self
            .inner
            .cache
            .get(id)
            .map(|entry| (entry.is_expired(timeout), entry.state.clone()));
        match cached {
            Some((false, state)) => {
                self.inner.metrics().cache_hits += 1;
                return Ok(Some(state));
            }
            Some((true, _)) => {
                self.inner.cache.remove(id);
            }
            None => {}
        }
        self.inner.metrics().cache_misses += 1;

        let (primary, secondary) = self.backends();
        let Some(primary) = primary else {
            return Err(HybridError::NoBackend);
        };

        let primary_err = match self.load_from(primary.as_ref(), id).await {
            Ok(Some(state)) => {
                self.cache_loaded(&state, secondary).await;
                return Ok(Some(state));
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("loading conversation {id} from {} backend failed: {e}", primary.kind());
                Some(e)
            }
        };

        let secondary = match secondary {
            Some(secondary) if self.fallback_enabled() => secondary,
            _ => {
                return match primary_err {
                    Some(source) => Err(HybridError::Backend {
                        kind: primary.kind(),
                        source,
                    }),
                    None => Ok(None),
                };
            }
        };

        match self.load_from(secondary.as_ref(), id).await {
            Ok(Some(state)) => {
                self.cache_loaded(&state, Some(primary)).await;
                Ok(Some(state))
            }
            Ok(None) => match primary_err {
                Some(source) => Err(HybridError::Backend {
                    kind: primary.kind(),
                    source,
                }),
                None => Ok(None),
            },
            Err(secondary_err) => match primary_err {
                Some(primary_err) => Err(HybridError::Exhausted {
                    primary_kind: primary.kind(),
                    primary: primary_err,
                    secondary_kind: secondary.kind(),
                    secondary: secondary_err,
                }),
                None => {
                    tracing::warn!(
                        "loading conversation {id} from {} backend failed: {secondary_err}",
                        secondary.kind()
                    );
                    Ok(None)
                }
            },
        }
    }

    async fn cache_loaded(&self, state: &ConversationState, other: Option<&Arc<dyn StateBackend>>) {
        self.inner
            .cache
            .insert(state.id.clone(), CacheEntry::new(state.clone()));
        if let (true, Some(other)) = (self.sync_enabled(), other) {
            self.replicate(other.as_ref(), state).await;
        }
    }

    fn configured_backends(&self) -> Vec<Arc<dyn StateBackend>> {
        self.inner
            .database
            .iter()
            .chain(self.inner.file.iter())
            .cloned()
            .collect()
    }

    /// Remove from the cache and every backend. Returns whether any backend
    /// held the conversation.
    pub async fn remove(&self, id: &str) -> Result<bool, HybridError> {
        if id.trim().is_empty() {
            return Err(HybridError::InvalidId);
        }
        self.inner.cache.remove(id);

        let backends = self.configured_backends();
        let results = join_all(backends.iter().map(|b| b.remove(id))).await;
        let mut removed = false;
        for (backend, result) in backends.iter().zip(results) {
            self.record(backend.kind(), Op::Write, result.is_ok());
            match result {
                Ok(found) => removed |= found,
                Err(e) => tracing::warn!(
                    "removing conversation {id} from {} backend failed: {e}",
                    backend.kind()
                ),
            }
        }
        Ok(removed)
    }

    /// Union of the ids known to every backend, sorted.
    pub async fn list(&self) -> Vec<String> {
        let backends = self.configured_backends();
        let results = join_all(backends.iter().map(|b| b.list())).await;
        let mut ids = BTreeSet::new();
        for (backend, result) in backends.iter().zip(results) {
            self.record(backend.kind(), Op::Read, result.is_ok());
            match result {
                Ok(found) => ids.extend(found),
                Err(e) => tracing::warn!("listing {} backend failed: {e}", backend.kind()),
            }
        }
        ids.into_iter().collect()
    }

    /// Evict expired cache entries and drop backend data older than the
    /// retention window.
    pub async fn cleanup_expired(&self) -> CleanupSummary {
        let mut summary = CleanupSummary {
            cache_evicted: self.inner.evict_expired(),
            ..Default::default()
        };
        let retention_days = self.inner.config.retention_days;
        let backends = self.configured_backends();
        let results = join_all(backends.iter().map(|b| b.cleanup_expired(retention_days))).await;
        for (backend, result) in backends.iter().zip(results) {
            self.record(backend.kind(), Op::Write, result.is_ok());
            match (backend.kind(), result) {
                (BackendKind::Database, Ok(n)) => summary.database_removed = n,
                (BackendKind::File, Ok(n)) => summary.file_removed = n,
                (kind, Err(e)) => tracing::warn!("cleanup of {kind} backend failed: {e}"),
            }
        }
        tracing::info!(
            "hybrid cleanup: {} cache, {} database, {} file entries removed",
            summary.cache_evicted,
            summary.database_removed,
            summary.file_removed
        );
        summary
    }

    pub fn metrics(&self) -> PersistenceMetrics {
        let mut metrics = self.inner.metrics().clone();
        metrics.cache_size = self.inner.cache.len();
        metrics
    }

    /// Healthy while every configured backend keeps its error rate under 10%.
    pub fn is_healthy(&self) -> bool {
        let metrics = self.inner.metrics();
        let database_ok = self.inner.database.is_none() || metrics.database.is_healthy();
        let file_ok = self.inner.file.is_none() || metrics.file.is_healthy();
        database_ok && file_ok
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Evict expired cache entries. Also run periodically once
    /// [`start_cache_cleanup`](Self::start_cache_cleanup) is called.
    pub fn evict_expired(&self) -> usize {
        self.inner.evict_expired()
    }

    /// Start the periodic cache purge. Calling it again is a no-op.
    pub fn start_cache_cleanup(&self) {
        let Ok(mut slot) = self.inner.cleanup_timer.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|t| t.is_active()) {
            return;
        }
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        *slot = RecurringTask::spawn(
            "cache-cleanup",
            self.inner.config.cache_cleanup_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => {
                            inner.evict_expired();
                            true
                        }
                        None => false,
                    }
                }
            },
        );
    }

    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.inner.cleanup_timer.lock() {
            if let Some(mut timer) = slot.take() {
                timer.cancel();
            }
        }
        let cached = self.inner.cache.len();
        self.inner.cache.clear();
        tracing::info!("hybrid state store shut down ({cached} cache entries dropped)");
    }
}
