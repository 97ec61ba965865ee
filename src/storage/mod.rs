//! Durable-storage collaborator contract.
//!
//! The consumer, the session tracker and the hybrid store's database backend
//! all talk to storage through [`StorageCollaborator`]. The SQLite
//! implementation lives in [`crate::db::SqliteStorage`].

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::AgentEvent;
use crate::core::{AgentSessionRecord, ConversationFilter, ConversationState, PhaseTransition};
use crate::db::DbError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage is disabled")]
    Disabled,
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("{0}")]
    Database(#[from] DbError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Io(_) => true,
            Self::Database(err) => err.is_transient(),
            Self::Disabled | Self::Validation(_) | Self::Serialization(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Result envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StorageResponse<T> {
    pub data: T,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

pub type StorageResult<T> = Result<StorageResponse<T>, StorageError>;

/// Run a storage operation and wrap its output with timing information.
pub async fn timed<T, Fut>(op: Fut) -> StorageResult<T>
where
    Fut: Future<Output = Result<T, StorageError>>,
{
    let started = Instant::now();
    let data = op.await?;
    Ok(StorageResponse {
        data,
        execution_time_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
    })
}

/// Synchronous variant of [`timed`] for blocking backends.
pub fn timed_sync<T>(op: impl FnOnce() -> Result<T, StorageError>) -> StorageResult<T> {
    let started = Instant::now();
    let data = op()?;
    Ok(StorageResponse {
        data,
        execution_time_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StorageCollaborator: Send + Sync {
    /// Disabled storage is skipped by the consumer and the tracker.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn save_conversation(&self, state: &ConversationState) -> StorageResult<String>;

    async fn get_conversation(&self, id: &str) -> StorageResult<Option<ConversationState>>;

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> StorageResult<Vec<ConversationState>>;

    async fn delete_conversation(&self, id: &str) -> StorageResult<bool>;

    /// Insert or update a session record. A finished record is never moved
    /// back to active.
    async fn save_agent_session(&self, record: &AgentSessionRecord) -> StorageResult<String>;

    /// Insert a session record only if none exists yet. Returns whether it was inserted.
    async fn create_agent_session(&self, record: &AgentSessionRecord) -> StorageResult<bool>;

    async fn save_phase_transition(
        &self,
        session_id: &str,
        transition: &PhaseTransition,
    ) -> StorageResult<String>;

    async fn save_tool_execution(
        &self,
        session_id: &str,
        tool_name: &str,
        params: &serde_json::Value,
        result: Option<&serde_json::Value>,
        duration_ms: u64,
    ) -> StorageResult<String>;

    /// Append an event to the generic event log.
    async fn record_event(&self, event: &AgentEvent) -> StorageResult<String>;

    async fn cleanup_old_data(&self, retention_days: u32) -> StorageResult<u64>;
}
