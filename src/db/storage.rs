//! [`StorageCollaborator`] backed by the SQLite database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use uuid::Uuid;

use super::{queries, Database};
use crate::bus::AgentEvent;
use crate::core::{AgentSessionRecord, ConversationFilter, ConversationState, PhaseTransition};
use crate::storage::{timed_sync, StorageCollaborator, StorageError, StorageResult};

/// Fixed-width UTC timestamps so that string comparison in SQL orders correctly.
pub(crate) fn db_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct SqliteStorage {
    db: Arc<Database>,
    enabled: AtomicBool,
}

impl SqliteStorage {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        tracing::info!("sqlite storage {}", if enabled { "enabled" } else { "disabled" });
    }

    fn ensure_enabled(&self) -> Result<(), StorageError> {
        if self.enabled.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StorageError::Disabled)
        }
    }
}

fn require_id(field: &str, value: &str) -> Result<(), StorageError> {
    if value.trim().is_empty() {
        return Err(StorageError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn session_row(record: &AgentSessionRecord) -> Result<queries::AgentSessionRow, StorageError> {
    require_id("session id", &record.session_id)?;
    Ok(queries::AgentSessionRow {
        session_id: record.session_id.clone(),
        conversation_id: record.conversation_id.clone(),
        status: record.status.to_string(),
        iteration_count: record.metrics.iteration_count as i64,
        tool_call_count: record.metrics.tool_call_count as i64,
        total_cost: record.metrics.total_cost,
        tokens_used: record.metrics.tokens_used as i64,
        metrics_json: serde_json::to_string(&record.metrics)?,
        started_at: db_timestamp(record.started_at),
        updated_at: db_timestamp(record.updated_at),
        completed_at: record.completed_at.map(db_timestamp),
    })
}

#[async_trait]
impl StorageCollaborator for SqliteStorage {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    async fn save_conversation(&self, state: &ConversationState) -> StorageResult<String> {
        timed_sync(|| {
            self.ensure_enabled()?;
            require_id("conversation id", &state.id)?;
            queries::upsert_conversation(
                &self.db,
                &queries::ConversationRow {
                    id: state.id.clone(),
                    session_id: state.session_id.clone(),
                    title: state.title.clone(),
                    state_json: serde_json::to_string(state)?,
                    message_count: state.messages.len() as i64,
                    created_at: db_timestamp(state.created_at),
                    updated_at: db_timestamp(state.updated_at),
                },
            )?;
            Ok(state.id.clone())
        })
    }

    async fn get_conversation(&self, id: &str) -> StorageResult<Option<ConversationState>> {
        timed_sync(|| {
            self.ensure_enabled()?;
            let Some(row) = queries::get_conversation(&self.db, id)? else {
                return Ok(None);
            };
            Ok(Some(serde_json::from_str(&row.state_json)?))
        })
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> StorageResult<Vec<ConversationState>> {
        timed_sync(|| {
            self.ensure_enabled()?;
            let updated_before = filter.updated_before.map(db_timestamp);
            let rows = queries::list_conversations(
                &self.db,
                filter.session_id.as_deref(),
                updated_before.as_deref(),
                filter.limit,
            )?;
            let mut states = Vec::with_capacity(rows.len());
            for row in rows {
                match serde_json::from_str::<ConversationState>(&row.state_json) {
                    Ok(state) => states.push(state),
                    Err(e) => tracing::warn!("skipping unreadable conversation {}: {e}", row.id),
                }
            }
            Ok(states)
        })
    }

    async fn delete_conversation(&self, id: &str) -> StorageResult<bool> {
        timed_sync(|| {
            self.ensure_enabled()?;
            Ok(queries::delete_conversation(&self.db, id)?)
        })
    }

    async fn save_agent_session(&self, record: &AgentSessionRecord) -> StorageResult<String> {
        timed_sync(|| {
            self.ensure_enabled()?;
            queries::upsert_agent_session(&self.db, &session_row(record)?)?;
            Ok(record.session_id.clone())
        })
    }

    async fn create_agent_session(&self, record: &AgentSessionRecord) -> StorageResult<bool> {
        timed_sync(|| {
            self.ensure_enabled()?;
            Ok(queries::insert_agent_session(&self.db, &session_row(record)?)?)
        })
    }

    async fn save_phase_transition(
        &self,
        session_id: &str,
        transition: &PhaseTransition,
    ) -> StorageResult<String> {
        timed_sync(|| {
            self.ensure_enabled()?;
            require_id("session id", session_id)?;
            let id = Uuid::new_v4().to_string();
            queries::insert_phase_transition(
                &self.db,
                &queries::PhaseTransitionRow {
                    id: id.clone(),
                    session_id: session_id.to_string(),
                    from_phase: transition.from.to_string(),
                    to_phase: transition.to.to_string(),
                    reason: transition.reason.clone(),
                    duration_ms: transition.duration_ms as i64,
                    created_at: db_timestamp(transition.timestamp),
                },
            )?;
            Ok(id)
        })
    }

    async fn save_tool_execution(
        &self,
        session_id: &str,
        tool_name: &str,
        params: &serde_json::Value,
        result: Option<&serde_json::Value>,
        duration_ms: u64,
    ) -> StorageResult<String> {
        timed_sync(|| {
            self.ensure_enabled()?;
            require_id("session id", session_id)?;
            require_id("tool name", tool_name)?;
            let id = Uuid::new_v4().to_string();
            queries::insert_tool_execution(
                &self.db,
                &queries::ToolExecutionRow {
                    id: id.clone(),
                    session_id: session_id.to_string(),
                    tool_name: tool_name.to_string(),
                    params_json: params.to_string(),
                    result_json: result.map(|r| r.to_string()),
                    duration_ms: duration_ms as i64,
                    created_at: db_timestamp(Utc::now()),
                },
            )?;
            Ok(id)
        })
    }

    async fn record_event(&self, event: &AgentEvent) -> StorageResult<String> {
        timed_sync(|| {
            self.ensure_enabled()?;
            require_id("session id", &event.session_id)?;
            queries::insert_event(
                &self.db,
                &queries::EventRow {
                    id: event.id.clone(),
                    session_id: event.session_id.clone(),
                    conversation_id: event.conversation_id.clone(),
                    seq: event.seq,
                    kind: event.kind.to_string(),
                    payload_json: serde_json::to_string(&event.payload)?,
                    created_at: db_timestamp(event.timestamp),
                },
            )?;
            Ok(event.id.clone())
        })
    }

    async fn cleanup_old_data(&self, retention_days: u32) -> StorageResult<u64> {
        timed_sync(|| {
            self.ensure_enabled()?;
            let cutoff = db_timestamp(Utc::now() - ChronoDuration::days(i64::from(retention_days)));
            let deleted = queries::delete_records_before(&self.db, &cutoff)?
                + queries::delete_conversations_before(&self.db, &cutoff)?;
            tracing::info!("retention cleanup removed {deleted} rows older than {retention_days} days");
            Ok(deleted)
        })
    }
}
