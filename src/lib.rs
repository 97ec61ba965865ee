//! Session persistence core for an autonomous coding-agent harness.
//!
//! Everything a run does (phase changes, tool calls, file touches, cost) is
//! recorded without ever blocking or failing the agent's control loop:
//! - `bus`: in-process publish/subscribe for agent lifecycle events
//! - `persistence`: background consumer that writes bus events to storage with retries
//! - `session`: per-session lifecycle tracking, analytics and auto-save
//! - `hybrid`: conversation state across a database and a file backend, behind a TTL cache
//! - `storage` / `db`: the storage contract and its SQLite implementation
//! - `config`: JSON + environment configuration
//! - `scheduler`: cancellable timers used by all of the above
//!
//! [`HarnessContext`] wires these together once at startup.

pub mod bus;
pub mod config;
pub mod core;
pub mod db;
pub mod hybrid;
pub mod persistence;
pub mod scheduler;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use bus::EventBus;
use config::{ConfigError, HarnessConfig};
use db::{Database, DbError, SqliteStorage};
use hybrid::HybridStateStore;
use persistence::EventPersistenceConsumer;
use session::SessionTracker;

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Db(#[from] DbError),
    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the fmt subscriber. `RUST_LOG` overrides the default filter.
/// Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agent_harness_lib=debug,info")),
        )
        .try_init();
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Every long-lived component of the pipeline, built once and passed down.
pub struct HarnessContext {
    pub config: HarnessConfig,
    pub database: Arc<Database>,
    pub storage: Arc<SqliteStorage>,
    pub bus: EventBus,
    pub consumer: EventPersistenceConsumer,
    pub tracker: SessionTracker,
    pub state_store: HybridStateStore,
}

impl HarnessContext {
    /// Open the database under `config.data_dir` and start every component.
    /// Must be called inside a tokio runtime.
    pub fn start(config: HarnessConfig) -> Result<Self, HarnessError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|source| HarnessError::DataDir {
            path: config.data_dir.clone(),
            source,
        })?;
        let database = Database::open(config.database_path())?;
        tracing::info!("opened database at {}", database.location());
        Ok(Self::assemble(config, Arc::new(database)))
    }

    /// Same as [`start`](Self::start) but with an in-memory database. The
    /// file backend still writes under the configured state directory.
    pub fn in_memory(config: HarnessConfig) -> Result<Self, HarnessError> {
        let database = Database::open_in_memory()?;
        Ok(Self::assemble(config, Arc::new(database)))
    }

    fn assemble(config: HarnessConfig, database: Arc<Database>) -> Self {
        let storage = Arc::new(SqliteStorage::new(database.clone()));
        let bus = EventBus::new(config.bus.clone());
        let consumer = EventPersistenceConsumer::new(&bus, storage.clone(), config.consumer.clone());
        let tracker = SessionTracker::new(Some(bus.clone()), storage.clone(), config.tracker.clone());
        let state_store =
            HybridStateStore::open(config.hybrid.clone(), storage.clone(), config.state_dir());
        state_store.start_cache_cleanup();

        tracing::info!("agent harness started (data dir {})", config.data_dir.display());
        Self {
            config,
            database,
            storage,
            bus,
            consumer,
            tracker,
            state_store,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.bus.is_healthy()
            && self.consumer.is_healthy()
            && self.tracker.is_healthy()
            && self.state_store.is_healthy()
    }

    /// Best-effort flush of everything in flight, upstream first.
    pub async fn shutdown(&self) {
        self.tracker.shutdown().await;
        self.bus.shutdown();
        self.consumer.shutdown().await;
        self.state_store.shutdown();
        tracing::info!("agent harness stopped");
    }
}
