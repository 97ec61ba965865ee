use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::AgentEvent;
use crate::core::{
    AgentSessionRecord, RingBuffer, SessionMetrics, SessionResult, SessionStartOptions,
    SessionStatus,
};

/// Number of recent events kept on each snapshot.
pub const RECENT_EVENT_CAPACITY: usize = 50;

/// In-memory view of one session as the tracker currently sees it.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub options: SessionStartOptions,
    pub status: SessionStatus,
    pub metrics: SessionMetrics,
    pub recent_events: RingBuffer<AgentEvent>,
    pub result: Option<SessionResult>,
    pub started_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub timestamp: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Tracker-wide change counter stamped on every mutation. A higher
    /// revision is always the newer state of the session.
    pub revision: u64,
}

impl SessionSnapshot {
    pub(crate) fn new(session_id: &str, options: SessionStartOptions) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            conversation_id: options.conversation_id.clone(),
            options,
            status: SessionStatus::Active,
            metrics: SessionMetrics::default(),
            recent_events: RingBuffer::new(RECENT_EVENT_CAPACITY),
            result: None,
            started_at: now,
            timestamp: now,
            completed_at: None,
            revision: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub(crate) fn touch(&mut self, revision: u64) {
        self.timestamp = Utc::now();
        self.revision = revision;
    }

    pub(crate) fn to_record(&self) -> AgentSessionRecord {
        AgentSessionRecord {
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
            status: self.status,
            metrics: self.metrics.clone(),
            started_at: self.started_at,
            updated_at: self.timestamp,
            completed_at: self.completed_at,
        }
    }
}
