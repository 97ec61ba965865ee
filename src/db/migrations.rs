use rusqlite::Connection;

use super::DbError;

struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: r#"
CREATE TABLE conversations (
    id            TEXT PRIMARY KEY,
    session_id    TEXT,
    title         TEXT,
    state_json    TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE agent_sessions (
    session_id       TEXT PRIMARY KEY,
    conversation_id  TEXT,
    status           TEXT NOT NULL DEFAULT 'active',
    iteration_count  INTEGER NOT NULL DEFAULT 0,
    tool_call_count  INTEGER NOT NULL DEFAULT 0,
    total_cost       REAL NOT NULL DEFAULT 0,
    tokens_used      INTEGER NOT NULL DEFAULT 0,
    metrics_json     TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    completed_at     TEXT
);

CREATE TABLE phase_transitions (
    id           TEXT PRIMARY KEY,
    session_id   TEXT NOT NULL,
    from_phase   TEXT NOT NULL,
    to_phase     TEXT NOT NULL,
    reason       TEXT,
    duration_ms  INTEGER NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE tool_executions (
    id           TEXT PRIMARY KEY,
    session_id   TEXT NOT NULL,
    tool_name    TEXT NOT NULL,
    params_json  TEXT NOT NULL,
    result_json  TEXT,
    duration_ms  INTEGER NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE events (
    id               TEXT PRIMARY KEY,
    session_id       TEXT NOT NULL,
    conversation_id  TEXT,
    seq              INTEGER NOT NULL,
    kind             TEXT NOT NULL,
    payload_json     TEXT NOT NULL,
    created_at       TEXT NOT NULL
);
"#,
    },
    Migration {
        version: 2,
        sql: r#"
CREATE INDEX idx_conversations_session ON conversations(session_id, updated_at);
CREATE INDEX idx_agent_sessions_status ON agent_sessions(status, updated_at);
CREATE INDEX idx_phase_transitions_session ON phase_transitions(session_id, created_at);
CREATE INDEX idx_tool_executions_session ON tool_executions(session_id, created_at);
CREATE INDEX idx_events_session_seq ON events(session_id, seq);
"#,
    },
];

pub(super) fn run_migrations(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );",
    )?;

    let applied: Vec<i64> = {
        let mut stmt = conn.prepare("SELECT version FROM _migrations ORDER BY version")?;
        let result = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        result
    };

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }

        tracing::info!("applying migration v{}", migration.version);

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DbError::Migration(format!("v{}: {e}", migration.version)))?;
        tx.execute(
            "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
            rusqlite::params![migration.version],
        )?;
        tx.commit()?;
    }

    Ok(())
}
