//! EventPersistenceConsumer unit tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::bus::{EventBus, EventKind, EventPayload};
use crate::config::{BusConfig, ConsumerConfig};
use crate::core::{
    AgentSessionRecord, CostUpdate, FileOperation, FileOperationKind, Phase, PhaseTransition,
    SessionMetrics, SessionResult, SessionStartOptions, SessionStatus, ToolExecution,
};
use crate::storage::StorageCollaborator;
use crate::persistence::EventPersistenceConsumer;
use crate::testing::{FailureMode, SpyStorage, StorageCall};

fn bus() -> EventBus {
    EventBus::new(BusConfig::default())
}

fn config(max_retries: u32, retry_delay_ms: u64) -> ConsumerConfig {
    ConsumerConfig {
        enable_batching: false,
        max_retries,
        retry_delay_ms,
        ..Default::default()
    }
}

fn transition(from: Phase, to: Phase) -> EventPayload {
    EventPayload::PhaseTransition(PhaseTransition::new(from, to, 1_000))
}

fn file_touch(path: &str) -> EventPayload {
    EventPayload::FileOperation(FileOperation {
        path: path.to_string(),
        kind: FileOperationKind::Create,
        bytes: Some(64),
    })
}

#[tokio::test]
async fn test_three_phase_transitions_are_all_persisted() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    let consumer = EventPersistenceConsumer::new(&bus, storage.clone(), config(3, 10));

    bus.emit("s1", None, transition(Phase::Exploration, Phase::Delegation));
    bus.emit("s1", None, transition(Phase::Delegation, Phase::Exploration));
    bus.emit("s1", None, transition(Phase::Exploration, Phase::Completion));
    consumer.flush().await;

    let stats = consumer.processing_stats();
    assert_eq!(stats.total_processed, 3);
    assert_eq!(stats.successful, 3);
    assert_eq!(stats.failed, 0);
    assert!(stats.last_processed_at.is_some());
    assert_eq!(storage.transitions().len(), 3);
    assert!(consumer.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_write_is_retried_with_linear_backoff_then_dropped() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    storage.fail_always(StorageCall::SavePhaseTransition, FailureMode::Transient);
    let max_retries = 3;
    let consumer = EventPersistenceConsumer::new(&bus, storage.clone(), config(max_retries, 100));

    bus.emit("s1", None, transition(Phase::Exploration, Phase::Delegation));
    consumer.flush().await;

    let times = storage.call_times(StorageCall::SavePhaseTransition);
    assert_eq!(times.len(), max_retries as usize + 1);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps.windows(2).all(|g| g[1] >= g[0]), "gaps must not shrink: {gaps:?}");
    assert_eq!(gaps[0], Duration::from_millis(100));
    assert_eq!(gaps[2], Duration::from_millis(300));

    let stats = consumer.processing_stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, u64::from(max_retries));
    assert_eq!(stats.successful, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers_within_retry_budget() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    storage.fail_times(StorageCall::RecordEvent, 2, FailureMode::Transient);
    let consumer = EventPersistenceConsumer::new(&bus, storage.clone(), config(3, 50));

    bus.emit("s1", None, file_touch("src/routes.rs"));
    consumer.flush().await;

    let stats = consumer.processing_stats();
    assert_eq!(stats.successful, 1);
    assert_eq!(stats.retried, 2);
    assert_eq!(storage.call_count(StorageCall::RecordEvent), 3);
    assert_eq!(storage.events().len(), 1);
}

#[tokio::test]
async fn test_validation_errors_are_not_retried() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    storage.fail_always(StorageCall::RecordEvent, FailureMode::Validation);
    let consumer = EventPersistenceConsumer::new(&bus, storage.clone(), config(5, 10));

    bus.emit("s1", None, file_touch("README.md"));
    bus.emit("", None, file_touch("README.md"));
    consumer.flush().await;

    // The second event never reaches storage: an empty session id is rejected up front.
    assert_eq!(storage.call_count(StorageCall::RecordEvent), 1);
    let stats = consumer.processing_stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.retried, 0);
}

#[tokio::test]
async fn test_disabled_storage_skips_without_counting() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    storage.set_enabled(false);
    let consumer = EventPersistenceConsumer::new(&bus, storage.clone(), config(3, 10));

    bus.emit("s1", None, file_touch("a.rs"));
    bus.emit("s1", None, transition(Phase::Exploration, Phase::Delegation));
    consumer.flush().await;

    let stats = consumer.processing_stats();
    assert_eq!(stats.total_processed, 0);
    assert_eq!(stats.successful, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.skipped, 2);
    assert_eq!(storage.call_count(StorageCall::RecordEvent), 0);
}

#[tokio::test]
async fn test_events_route_to_matching_storage_calls() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    let consumer = EventPersistenceConsumer::new(&bus, storage.clone(), config(0, 10));
    let started_at = Utc::now();

    bus.emit(
        "s1",
        Some("conv-9".to_string()),
        EventPayload::SessionStarted {
            options: SessionStartOptions::default(),
        },
    );
    bus.emit(
        "s1",
        None,
        EventPayload::ToolExecutionCompleted(ToolExecution {
            tool_name: "cmd.exec".to_string(),
            params: json!({"cmd": "cargo fmt"}),
            result: Some(json!({"exit_code": 0})),
            success: true,
            duration_ms: 840,
            error: None,
        }),
    );
    bus.emit(
        "s1",
        None,
        EventPayload::CostUpdate {
            update: CostUpdate {
                cost_delta: 0.02,
                tokens_delta: 900,
                model: Some("m".to_string()),
            },
            total_cost: 0.02,
        },
    );
    bus.emit(
        "s1",
        None,
        EventPayload::SessionCompleted {
            status: SessionStatus::Completed,
            result: SessionResult::succeeded("done"),
            metrics: SessionMetrics {
                iteration_count: 7,
                ..Default::default()
            },
            started_at,
            record_saved: false,
        },
    );
    consumer.flush().await;

    let sessions = storage.saved_sessions();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].status, SessionStatus::Active);
    assert_eq!(sessions[0].conversation_id.as_deref(), Some("conv-9"));
    assert_eq!(sessions[1].status, SessionStatus::Completed);
    assert_eq!(sessions[1].metrics.iteration_count, 7);
    assert!(sessions[1].completed_at.is_some());

    let tools = storage.tool_executions();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].duration_ms, 840);
    assert_eq!(tools[0].result.as_ref().unwrap()["success"], json!(true));

    assert_eq!(storage.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retried_session_start_does_not_reset_a_later_save() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    storage.fail_times(StorageCall::CreateAgentSession, 1, FailureMode::Transient);
    let consumer = EventPersistenceConsumer::new(&bus, storage.clone(), config(3, 1_000));

    bus.emit(
        "s1",
        None,
        EventPayload::SessionStarted {
            options: SessionStartOptions::default(),
        },
    );
    tokio::task::yield_now().await;

    // The tracker saves real progress while the start is waiting to be retried.
    let now = Utc::now();
    let progressed = AgentSessionRecord {
        session_id: "s1".to_string(),
        conversation_id: None,
        status: SessionStatus::Active,
        metrics: SessionMetrics {
            iteration_count: 7,
            ..Default::default()
        },
        started_at: now,
        updated_at: now,
        completed_at: None,
    };
    storage.save_agent_session(&progressed).await.unwrap();

    consumer.flush().await;

    assert_eq!(storage.call_count(StorageCall::CreateAgentSession), 2);
    assert_eq!(consumer.processing_stats().retried, 1);
    assert_eq!(storage.saved_sessions().len(), 1);
    assert_eq!(
        storage.last_saved_session("s1").unwrap().metrics.iteration_count,
        7
    );
}

#[tokio::test]
async fn test_completion_already_saved_by_publisher_is_only_logged() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    let consumer = EventPersistenceConsumer::new(&bus, storage.clone(), config(0, 10));

    bus.emit(
        "s1",
        None,
        EventPayload::SessionCompleted {
            status: SessionStatus::Completed,
            result: SessionResult::succeeded("done"),
            metrics: SessionMetrics::default(),
            started_at: Utc::now(),
            record_saved: true,
        },
    );
    consumer.flush().await;

    assert_eq!(storage.call_count(StorageCall::SaveAgentSession), 0);
    let events = storage.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::SessionCompleted);
    assert_eq!(consumer.processing_stats().successful, 1);
}

#[tokio::test]
async fn test_batched_events_wait_for_batch_size() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    let consumer = EventPersistenceConsumer::new(
        &bus,
        storage.clone(),
        ConsumerConfig {
            enable_batching: true,
            batch_size: 3,
            flush_interval_ms: 60_000,
            max_retries: 0,
            retry_delay_ms: 1,
        },
    );

    bus.emit("s1", None, file_touch("a.rs"));
    bus.emit("s1", None, file_touch("b.rs"));
    tokio::task::yield_now().await;
    assert_eq!(storage.events().len(), 0);

    bus.emit("s1", None, file_touch("c.rs"));
    consumer.flush().await;
    assert_eq!(storage.events().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_batch_timer_flushes_partial_batch() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    let _consumer = EventPersistenceConsumer::new(
        &bus,
        storage.clone(),
        ConsumerConfig {
            enable_batching: true,
            batch_size: 50,
            flush_interval_ms: 500,
            max_retries: 0,
            retry_delay_ms: 1,
        },
    );

    bus.emit("s1", None, file_touch("a.rs"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(storage.events().len(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(storage.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_event_does_not_block_rest_of_batch() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    storage.fail_always(StorageCall::RecordEvent, FailureMode::Transient);
    let consumer = EventPersistenceConsumer::new(
        &bus,
        storage.clone(),
        ConsumerConfig {
            enable_batching: true,
            batch_size: 10,
            flush_interval_ms: 60_000,
            max_retries: 2,
            retry_delay_ms: 10,
        },
    );

    bus.emit("s1", None, transition(Phase::Exploration, Phase::Delegation));
    bus.emit("s1", None, file_touch("poison.rs"));
    bus.emit("s1", None, transition(Phase::Delegation, Phase::Completion));
    consumer.flush().await;

    assert_eq!(storage.transitions().len(), 2);
    let stats = consumer.processing_stats();
    assert_eq!(stats.successful, 2);
    assert_eq!(stats.failed, 1);
    assert!(!consumer.is_healthy());
}

#[tokio::test]
async fn test_shutdown_unsubscribes_from_bus() {
    let bus = bus();
    let storage = Arc::new(SpyStorage::new());
    let consumer = EventPersistenceConsumer::new(&bus, storage.clone(), config(0, 1));
    assert_eq!(bus.metrics().listener_count, EventKind::all().len());

    bus.emit("s1", None, file_touch("a.rs"));
    consumer.shutdown().await;
    assert_eq!(bus.metrics().listener_count, 0);
    assert_eq!(storage.events().len(), 1);

    bus.emit("s1", None, file_touch("b.rs"));
    assert_eq!(consumer.processing_stats().total_processed, 1);
}
