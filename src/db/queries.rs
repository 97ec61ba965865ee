use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{Database, DbError};

// ---------------------------------------------------------------------------
// Row types: flat structs that map directly to table columns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRow {
    pub id: String,
    pub session_id: Option<String>,
    pub title: Option<String>,
    pub state_json: String,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSessionRow {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub status: String,
    pub iteration_count: i64,
    pub tool_call_count: i64,
    pub total_cost: f64,
    pub tokens_used: i64,
    pub metrics_json: String,
    pub started_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTransitionRow {
    pub id: String,
    pub session_id: String,
    pub from_phase: String,
    pub to_phase: String,
    pub reason: Option<String>,
    pub duration_ms: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolExecutionRow {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub params_json: String,
    pub result_json: Option<String>,
    pub duration_ms: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub id: String,
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub seq: i64,
    pub kind: String,
    pub payload_json: String,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Conversation queries
// ---------------------------------------------------------------------------

const CONVERSATION_COLUMNS: &str =
    "id, session_id, title, state_json, message_count, created_at, updated_at";

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        title: row.get(2)?,
        state_json: row.get(3)?,
        message_count: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn upsert_conversation(db: &Database, row: &ConversationRow) -> Result<(), DbError> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO conversations (id, session_id, title, state_json, message_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id)
         DO UPDATE SET session_id = excluded.session_id,
                       title = excluded.title,
                       state_json = excluded.state_json,
                       message_count = excluded.message_count,
                       updated_at = excluded.updated_at",
        params![
            row.id,
            row.session_id,
            row.title,
            row.state_json,
            row.message_count,
            row.created_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_conversation(db: &Database, id: &str) -> Result<Option<ConversationRow>, DbError> {
    let conn = db.conn()?;
    let row = conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id],
            conversation_from_row,
        )
        .optional()?;
    Ok(row)
}

/// List conversations, newest first. `None` filters are not applied.
pub fn list_conversations(
    db: &Database,
    session_id: Option<&str>,
    updated_before: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<ConversationRow>, DbError> {
    let conn = db.conn()?;
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS}
         FROM conversations
         WHERE (?1 IS NULL OR session_id = ?1)
           AND (?2 IS NULL OR updated_at < ?2)
         ORDER BY updated_at DESC
         LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(params![session_id, updated_before, limit], conversation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_conversation(db: &Database, id: &str) -> Result<bool, DbError> {
    let conn = db.conn()?;
    let affected = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
    Ok(affected > 0)
}

// ---------------------------------------------------------------------------
// Agent session queries
// ---------------------------------------------------------------------------

pub fn upsert_agent_session(db: &Database, row: &AgentSessionRow) -> Result<(), DbError> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO agent_sessions (session_id, conversation_id, status, iteration_count, tool_call_count,
                                     total_cost, tokens_used, metrics_json, started_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(session_id)
         DO UPDATE SET conversation_id = COALESCE(excluded.conversation_id, agent_sessions.conversation_id),
                       status = excluded.status,
                       iteration_count = excluded.iteration_count,
                       tool_call_count = excluded.tool_call_count,
                       total_cost = excluded.total_cost,
                       tokens_used = excluded.tokens_used,
                       metrics_json = excluded.metrics_json,
                       updated_at = excluded.updated_at,
                       completed_at = excluded.completed_at
         WHERE agent_sessions.status = 'active' OR excluded.status != 'active'",
        params![
            row.session_id,
            row.conversation_id,
            row.status,
            row.iteration_count,
            row.tool_call_count,
            row.total_cost,
            row.tokens_used,
            row.metrics_json,
            row.started_at,
            row.updated_at,
            row.completed_at,
        ],
    )?;
    Ok(())
}

/// Insert a session row unless one already exists. Returns whether a row was inserted.
pub fn insert_agent_session(db: &Database, row: &AgentSessionRow) -> Result<bool, DbError> {
    let conn = db.conn()?;
    let affected = conn.execute(
        "INSERT INTO agent_sessions (session_id, conversation_id, status, iteration_count, tool_call_count,
                                     total_cost, tokens_used, metrics_json, started_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(session_id) DO NOTHING",
        params![
            row.session_id,
            row.conversation_id,
            row.status,
            row.iteration_count,
            row.tool_call_count,
            row.total_cost,
            row.tokens_used,
            row.metrics_json,
            row.started_at,
            row.updated_at,
            row.completed_at,
        ],
    )?;
    Ok(affected > 0)
}

pub fn get_agent_session(db: &Database, session_id: &str) -> Result<Option<AgentSessionRow>, DbError> {
    let conn = db.conn()?;
    let row = conn
        .query_row(
            "SELECT session_id, conversation_id, status, iteration_count, tool_call_count,
                    total_cost, tokens_used, metrics_json, started_at, updated_at, completed_at
             FROM agent_sessions WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok(AgentSessionRow {
                    session_id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    status: row.get(2)?,
                    iteration_count: row.get(3)?,
                    tool_call_count: row.get(4)?,
                    total_cost: row.get(5)?,
                    tokens_used: row.get(6)?,
                    metrics_json: row.get(7)?,
                    started_at: row.get(8)?,
                    updated_at: row.get(9)?,
                    completed_at: row.get(10)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Phase transition queries
// ---------------------------------------------------------------------------

pub fn insert_phase_transition(db: &Database, row: &PhaseTransitionRow) -> Result<(), DbError> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO phase_transitions (id, session_id, from_phase, to_phase, reason, duration_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            row.id,
            row.session_id,
            row.from_phase,
            row.to_phase,
            row.reason,
            row.duration_ms,
            row.created_at,
        ],
    )?;
    Ok(())
}

pub fn list_phase_transitions(
    db: &Database,
    session_id: &str,
) -> Result<Vec<PhaseTransitionRow>, DbError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(
        "SELECT id, session_id, from_phase, to_phase, reason, duration_ms, created_at
         FROM phase_transitions
         WHERE session_id = ?1
         ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok(PhaseTransitionRow {
                id: row.get(0)?,
                session_id: row.get(1)?,
                from_phase: row.get(2)?,
                to_phase: row.get(3)?,
                reason: row.get(4)?,
                duration_ms: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Tool execution queries
// ---------------------------------------------------------------------------

pub fn insert_tool_execution(db: &Database, row: &ToolExecutionRow) -> Result<(), DbError> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO tool_executions (id, session_id, tool_name, params_json, result_json, duration_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            row.id,
            row.session_id,
            row.tool_name,
            row.params_json,
            row.result_json,
            row.duration_ms,
            row.created_at,
        ],
    )?;
    Ok(())
}

pub fn list_tool_executions(
    db: &Database,
    session_id: &str,
) -> Result<Vec<ToolExecutionRow>, DbError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(
        "SELECT id, session_id, tool_name, params_json, result_json, duration_ms, created_at
         FROM tool_executions
         WHERE session_id = ?1
         ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok(ToolExecutionRow {
                id: row.get(0)?,
                session_id: row.get(1)?,
                tool_name: row.get(2)?,
                params_json: row.get(3)?,
                result_json: row.get(4)?,
                duration_ms: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Event queries
// ---------------------------------------------------------------------------

pub fn insert_event(db: &Database, row: &EventRow) -> Result<(), DbError> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO events (id, session_id, conversation_id, seq, kind, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            row.id,
            row.session_id,
            row.conversation_id,
            row.seq,
            row.kind,
            row.payload_json,
            row.created_at,
        ],
    )?;
    Ok(())
}

pub fn list_events_for_session(db: &Database, session_id: &str) -> Result<Vec<EventRow>, DbError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(
        "SELECT id, session_id, conversation_id, seq, kind, payload_json, created_at
         FROM events
         WHERE session_id = ?1
         ORDER BY seq ASC, created_at ASC",
    )?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok(EventRow {
                id: row.get(0)?,
                session_id: row.get(1)?,
                conversation_id: row.get(2)?,
                seq: row.get(3)?,
                kind: row.get(4)?,
                payload_json: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// Delete lifecycle records created before `cutoff` (RFC 3339). Active
/// sessions are never removed. Returns the number of rows deleted.
pub fn delete_records_before(db: &Database, cutoff: &str) -> Result<u64, DbError> {
    let conn = db.conn()?;
    let tx = conn.unchecked_transaction()?;
    let mut deleted = 0usize;
    deleted += tx.execute("DELETE FROM events WHERE created_at < ?1", params![cutoff])?;
    deleted += tx.execute(
        "DELETE FROM tool_executions WHERE created_at < ?1",
        params![cutoff],
    )?;
    deleted += tx.execute(
        "DELETE FROM phase_transitions WHERE created_at < ?1",
        params![cutoff],
    )?;
    deleted += tx.execute(
        "DELETE FROM agent_sessions WHERE status != 'active' AND updated_at < ?1",
        params![cutoff],
    )?;
    tx.commit()?;
    Ok(deleted as u64)
}

/// Delete conversations last updated before `cutoff`.
pub fn delete_conversations_before(db: &Database, cutoff: &str) -> Result<u64, DbError> {
    let conn = db.conn()?;
    let affected = conn.execute(
        "DELETE FROM conversations WHERE updated_at < ?1",
        params![cutoff],
    )?;
    Ok(affected as u64)
}
