//! Test helpers shared across module test suites.
//!
//! [`SpyStorage`] is an in-memory [`StorageCollaborator`] that records every
//! call (with its tokio clock time) and can be scripted to fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::bus::AgentEvent;
use crate::core::{
    AgentSessionRecord, ConversationFilter, ConversationState, PhaseTransition,
};
use crate::storage::{timed_sync, StorageCollaborator, StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageCall {
    SaveConversation,
    GetConversation,
    ListConversations,
    DeleteConversation,
    SaveAgentSession,
    CreateAgentSession,
    SavePhaseTransition,
    SaveToolExecution,
    RecordEvent,
    CleanupOldData,
}

#[derive(Debug, Clone, Copy)]
pub enum FailureMode {
    Transient,
    Validation,
}

impl FailureMode {
    fn error(&self, call: StorageCall) -> StorageError {
        match self {
            Self::Transient => StorageError::Transient(format!("{call:?}: connection reset")),
            Self::Validation => StorageError::Validation(format!("{call:?}: rejected payload")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FailurePlan {
    Always(FailureMode),
    Times(u32, FailureMode),
}

#[derive(Debug, Clone)]
pub struct ToolExecutionCall {
    pub session_id: String,
    pub tool_name: String,
    pub params: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub duration_ms: u64,
}

pub struct SpyStorage {
    enabled: AtomicBool,
    calls: Mutex<Vec<(StorageCall, Instant)>>,
    failures: Mutex<HashMap<StorageCall, FailurePlan>>,
    conversations: Mutex<HashMap<String, ConversationState>>,
    sessions: Mutex<Vec<AgentSessionRecord>>,
    transitions: Mutex<Vec<(String, PhaseTransition)>>,
    tools: Mutex<Vec<ToolExecutionCall>>,
    events: Mutex<Vec<AgentEvent>>,
}

impl Default for SpyStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SpyStorage {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
            transitions: Mutex::new(Vec::new()),
            tools: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_always(&self, call: StorageCall, mode: FailureMode) {
        self.failures
            .lock()
            .expect("failures mutex")
            .insert(call, FailurePlan::Always(mode));
    }

    pub fn fail_times(&self, call: StorageCall, times: u32, mode: FailureMode) {
        self.failures
            .lock()
            .expect("failures mutex")
            .insert(call, FailurePlan::Times(times, mode));
    }

    pub fn heal(&self, call: StorageCall) {
        self.failures.lock().expect("failures mutex").remove(&call);
    }

    pub fn call_count(&self, call: StorageCall) -> usize {
        self.call_times(call).len()
    }

    pub fn call_times(&self, call: StorageCall) -> Vec<Instant> {
        self.calls
            .lock()
            .expect("calls mutex")
            .iter()
            .filter(|(c, _)| *c == call)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Every session record written, by save or by create, in write order.
    pub fn saved_sessions(&self) -> Vec<AgentSessionRecord> {
        self.sessions.lock().expect("sessions mutex").clone()
    }

    pub fn last_saved_session(&self, session_id: &str) -> Option<AgentSessionRecord> {
        self.saved_sessions()
            .into_iter()
            .rev()
            .find(|r| r.session_id == session_id)
    }

    pub fn transitions(&self) -> Vec<(String, PhaseTransition)> {
        self.transitions.lock().expect("transitions mutex").clone()
    }

    pub fn tool_executions(&self) -> Vec<ToolExecutionCall> {
        self.tools.lock().expect("tools mutex").clone()
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().expect("events mutex").clone()
    }

    pub fn stored_conversation(&self, id: &str) -> Option<ConversationState> {
        self.conversations
            .lock()
            .expect("conversations mutex")
            .get(id)
            .cloned()
    }

    fn check(&self, call: StorageCall) -> Result<(), StorageError> {
        self.calls
            .lock()
            .expect("calls mutex")
            .push((call, Instant::now()));
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(StorageError::Disabled);
        }
        let mut failures = self.failures.lock().expect("failures mutex");
        match failures.get(&call).copied() {
            Some(FailurePlan::Always(mode)) => Err(mode.error(call)),
            Some(FailurePlan::Times(remaining, mode)) => {
                if remaining <= 1 {
                    failures.remove(&call);
                } else {
                    failures.insert(call, FailurePlan::Times(remaining - 1, mode));
                }
                Err(mode.error(call))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageCollaborator for SpyStorage {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn save_conversation(&self, state: &ConversationState) -> StorageResult<String> {
        timed_sync(|| {
            self.check(StorageCall::SaveConversation)?;
            self.conversations
                .lock()
                .expect("conversations mutex")
                .insert(state.id.clone(), state.clone());
            Ok(state.id.clone())
        })
    }

    async fn get_conversation(&self, id: &str) -> StorageResult<Option<ConversationState>> {
        timed_sync(|| {
            self.check(StorageCall::GetConversation)?;
            Ok(self.stored_conversation(id))
        })
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> StorageResult<Vec<ConversationState>> {
        timed_sync(|| {
            self.check(StorageCall::ListConversations)?;
            let conversations = self.conversations.lock().expect("conversations mutex");
            let mut states: Vec<ConversationState> = conversations
                .values()
                .filter(|s| {
                    filter
                        .session_id
                        .as_ref()
                        .map_or(true, |id| s.session_id.as_ref() == Some(id))
                })
                .filter(|s| filter.updated_before.map_or(true, |t| s.updated_at < t))
                .cloned()
                .collect();
            states.sort_by(|a, b| a.id.cmp(&b.id));
            if let Some(limit) = filter.limit {
                states.truncate(limit);
            }
            Ok(states)
        })
    }

    async fn delete_conversation(&self, id: &str) -> StorageResult<bool> {
        timed_sync(|| {
            self.check(StorageCall::DeleteConversation)?;
            Ok(self
                .conversations
                .lock()
                .expect("conversations mutex")
                .remove(id)
                .is_some())
        })
    }

    async fn save_agent_session(&self, record: &AgentSessionRecord) -> StorageResult<String> {
        timed_sync(|| {
            self.check(StorageCall::SaveAgentSession)?;
            self.sessions
                .lock()
                .expect("sessions mutex")
                .push(record.clone());
            Ok(record.session_id.clone())
        })
    }

    async fn create_agent_session(&self, record: &AgentSessionRecord) -> StorageResult<bool> {
        timed_sync(|| {
            self.check(StorageCall::CreateAgentSession)?;
            let mut sessions = self.sessions.lock().expect("sessions mutex");
            if sessions.iter().any(|r| r.session_id == record.session_id) {
                return Ok(false);
            }
            sessions.push(record.clone());
            Ok(true)
        })
    }

    async fn save_phase_transition(
        &self,
        session_id: &str,
        transition: &PhaseTransition,
    ) -> StorageResult<String> {
        timed_sync(|| {
            self.check(StorageCall::SavePhaseTransition)?;
            let mut transitions = self.transitions.lock().expect("transitions mutex");
            transitions.push((session_id.to_string(), transition.clone()));
            Ok(format!("transition-{}", transitions.len()))
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
            self.check(StorageCall::SaveToolExecution)?;
            let mut tools = self.tools.lock().expect("tools mutex");
            tools.push(ToolExecutionCall {
                session_id: session_id.to_string(),
                tool_name: tool_name.to_string(),
                params: params.clone(),
                result: result.cloned(),
                duration_ms,
            });
            Ok(format!("tool-{}", tools.len()))
        })
    }

    async fn record_event(&self, event: &AgentEvent) -> StorageResult<String> {
        timed_sync(|| {
            self.check(StorageCall::RecordEvent)?;
            self.events
                .lock()
                .expect("events mutex")
                .push(event.clone());
            Ok(event.id.clone())
        })
    }

    async fn cleanup_old_data(&self, _retention_days: u32) -> StorageResult<u64> {
        timed_sync(|| {
            self.check(StorageCall::CleanupOldData)?;
            Ok(0)
        })
    }
}
