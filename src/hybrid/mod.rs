//! Hybrid persistence of conversation state.
//!
//! [`HybridStateStore`] keeps a TTL cache in front of two [`StateBackend`]s
//! (the database through the storage collaborator, and JSON files on disk)
//! and decides per call which one is primary, when to fall back, and when to
//! copy state across.

mod backend;
mod store;


pub use backend::{BackendKind, DatabaseBackend, FileBackend, StateBackend};
pub use store::{BackendMetrics, CacheEntry, CleanupSummary, HybridStateStore, PersistenceMetrics};

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum HybridError {
    #[error("conversation id must not be empty")]
    InvalidId,
    #[error("no state backend is available")]
    NoBackend,
    #[error("{kind} backend failed: {source}")]
    Backend {
        kind: BackendKind,
        #[source]
        source: StorageError,
    },
    #[error("{primary_kind} backend failed ({primary}) and {secondary_kind} fallback failed ({secondary})")]
    Exhausted {
        primary_kind: BackendKind,
        primary: StorageError,
        secondary_kind: BackendKind,
        secondary: StorageError,
    },
}
