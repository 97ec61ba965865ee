//! Database operations unit tests

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::bus::{AgentEvent, EventPayload};
use crate::core::{
    AgentSessionRecord, ConversationFilter, ConversationState, ErrorReport, Phase,
    PhaseTransition, SessionMetrics, SessionStatus,
};
use crate::db::{queries, Database, SqliteStorage};
use crate::storage::{StorageCollaborator, StorageError};

fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().expect("in-memory DB")))
}

fn session_record(session_id: &str, status: SessionStatus) -> AgentSessionRecord {
    let now = Utc::now();
    AgentSessionRecord {
        session_id: session_id.to_string(),
        conversation_id: Some("conv-1".to_string()),
        status,
        metrics: SessionMetrics {
            iteration_count: 4,
            tool_call_count: 9,
            total_cost: 0.42,
            tokens_used: 12_000,
            ..Default::default()
        },
        started_at: now,
        updated_at: now,
        completed_at: None,
    }
}

#[test]
fn test_migrations_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harness.db");
    drop(Database::open(&path).expect("first open"));
    let db = Database::open(&path).expect("second open re-runs migrations");

    let conn = db.conn().unwrap();
    let applied: i64 = conn
        .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
        .unwrap();
    assert_eq!(applied, 2);
}

#[tokio::test]
async fn test_conversation_upsert_and_reload() {
    let storage = storage();
    let mut state = ConversationState::new("conv-1");
    state.session_id = Some("s1".to_string());
    state.push_message("user", "add a health check endpoint");

    let saved = storage.save_conversation(&state).await.unwrap();
    assert_eq!(saved.data, "conv-1");

    state.push_message("assistant", "done");
    storage.save_conversation(&state).await.unwrap();

    let loaded = storage.get_conversation("conv-1").await.unwrap().data.unwrap();
    assert_eq!(loaded.messages.len(), 2);
    assert_eq!(loaded, state);

    let rows = queries::list_conversations(storage.database(), Some("s1"), None, None).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].message_count, 2);
}

#[tokio::test]
async fn test_list_conversations_applies_filter_and_limit() {
    let storage = storage();
    for i in 0..5 {
        let mut state = ConversationState::new(format!("conv-{i}"));
        state.session_id = Some(if i % 2 == 0 { "even" } else { "odd" }.to_string());
        storage.save_conversation(&state).await.unwrap();
    }

    let even = storage
        .list_conversations(&ConversationFilter {
            session_id: Some("even".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(even.data.len(), 3);

    let limited = storage
        .list_conversations(&ConversationFilter {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.data.len(), 2);
}

#[tokio::test]
async fn test_delete_conversation_reports_presence() {
    let storage = storage();
    storage
        .save_conversation(&ConversationState::new("gone"))
        .await
        .unwrap();

    assert!(storage.delete_conversation("gone").await.unwrap().data);
    assert!(!storage.delete_conversation("gone").await.unwrap().data);
    assert!(storage.get_conversation("gone").await.unwrap().data.is_none());
}

#[tokio::test]
async fn test_agent_session_upsert_keeps_latest_metrics() {
    let storage = storage();
    let mut record = session_record("s1", SessionStatus::Active);
    storage.save_agent_session(&record).await.unwrap();

    record.metrics.iteration_count = 11;
    record.status = SessionStatus::Completed;
    record.completed_at = Some(Utc::now());
    storage.save_agent_session(&record).await.unwrap();

    let row = queries::get_agent_session(storage.database(), "s1")
        .unwrap()
        .expect("session row");
    assert_eq!(row.status, "completed");
    assert_eq!(row.iteration_count, 11);
    assert!(row.completed_at.is_some());
    let metrics: SessionMetrics = serde_json::from_str(&row.metrics_json).unwrap();
    assert_eq!(metrics, record.metrics);
}

#[tokio::test]
async fn test_finished_session_is_not_moved_back_to_active() {
    let storage = storage();
    let mut finished = session_record("s1", SessionStatus::Completed);
    finished.metrics.iteration_count = 11;
    finished.completed_at = Some(Utc::now());
    storage.save_agent_session(&finished).await.unwrap();

    let stale = session_record("s1", SessionStatus::Active);
    storage.save_agent_session(&stale).await.unwrap();

    let row = queries::get_agent_session(storage.database(), "s1")
        .unwrap()
        .expect("session row");
    assert_eq!(row.status, "completed");
    assert_eq!(row.iteration_count, 11);
    assert!(row.completed_at.is_some());

    // Terminal to terminal is still an update.
    let mut failed = finished.clone();
    failed.status = SessionStatus::Failed;
    storage.save_agent_session(&failed).await.unwrap();
    let row = queries::get_agent_session(storage.database(), "s1")
        .unwrap()
        .expect("session row");
    assert_eq!(row.status, "failed");
}

#[tokio::test]
async fn test_create_agent_session_never_replaces_an_existing_row() {
    let storage = storage();
    let mut record = session_record("s1", SessionStatus::Active);
    record.metrics.iteration_count = 7;
    assert!(storage.create_agent_session(&record).await.unwrap().data);

    let fresh = AgentSessionRecord {
        metrics: SessionMetrics::default(),
        ..session_record("s1", SessionStatus::Active)
    };
    assert!(!storage.create_agent_session(&fresh).await.unwrap().data);

    let row = queries::get_agent_session(storage.database(), "s1")
        .unwrap()
        .expect("session row");
    assert_eq!(row.iteration_count, 7);

    let err = storage
        .create_agent_session(&session_record("", SessionStatus::Active))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));
}

#[tokio::test]
async fn test_phase_and_tool_records_are_listed_per_session() {
    let storage = storage();
    storage
        .save_phase_transition("s1", &PhaseTransition::new(Phase::Exploration, Phase::Delegation, 1_500))
        .await
        .unwrap();
    storage
        .save_tool_execution(
            "s1",
            "fs.read",
            &json!({"path": "src/main.rs"}),
            Some(&json!({"success": true})),
            12,
        )
        .await
        .unwrap();
    storage
        .save_tool_execution("s2", "cmd.exec", &json!({}), None, 3)
        .await
        .unwrap();

    let transitions = queries::list_phase_transitions(storage.database(), "s1").unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].from_phase, "exploration");
    assert_eq!(transitions[0].to_phase, "delegation");

    let tools = queries::list_tool_executions(storage.database(), "s1").unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].tool_name, "fs.read");
    assert_eq!(tools[0].duration_ms, 12);
}

#[tokio::test]
async fn test_record_event_stores_kind_and_payload() {
    let storage = storage();
    let event = AgentEvent::new(
        "s1",
        None,
        EventPayload::Error(ErrorReport {
            message: "rate limited".to_string(),
            source: Some("model".to_string()),
            recoverable: true,
        }),
    );
    storage.record_event(&event).await.unwrap();

    let rows = queries::list_events_for_session(storage.database(), "s1").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, "error");
    assert!(rows[0].payload_json.contains("rate limited"));
}

#[tokio::test]
async fn test_empty_session_id_is_a_validation_error() {
    let storage = storage();
    let err = storage
        .save_agent_session(&session_record("  ", SessionStatus::Active))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_disabled_storage_rejects_writes() {
    let storage = storage();
    storage.set_enabled(false);
    assert!(!storage.is_enabled());

    let err = storage
        .save_conversation(&ConversationState::new("c"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Disabled));
}

#[tokio::test]
async fn test_cleanup_removes_only_expired_rows() {
    let storage = storage();
    let old = Utc::now() - ChronoDuration::days(45);

    let mut stale = PhaseTransition::new(Phase::Exploration, Phase::Completion, 10);
    stale.timestamp = old;
    storage.save_phase_transition("s-old", &stale).await.unwrap();
    storage
        .save_phase_transition("s-new", &PhaseTransition::new(Phase::Exploration, Phase::Delegation, 10))
        .await
        .unwrap();

    let mut finished = session_record("s-old", SessionStatus::Completed);
    finished.updated_at = old;
    storage.save_agent_session(&finished).await.unwrap();
    let mut still_running = session_record("s-running", SessionStatus::Active);
    still_running.updated_at = old;
    storage.save_agent_session(&still_running).await.unwrap();

    let removed = storage.cleanup_old_data(30).await.unwrap();
    assert_eq!(removed.data, 2);

    assert!(queries::list_phase_transitions(storage.database(), "s-old")
        .unwrap()
        .is_empty());
    assert_eq!(
        queries::list_phase_transitions(storage.database(), "s-new").unwrap().len(),
        1
    );
    assert!(queries::get_agent_session(storage.database(), "s-running")
        .unwrap()
        .is_some());
}
