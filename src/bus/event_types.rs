//! Event kinds, payloads and the event envelope.
//!
//! Every consumer matches on [`EventPayload`] exhaustively, so adding a kind
//! is a compile error everywhere it is not handled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{
    CostUpdate, ErrorReport, FileOperation, PhaseTransition, ProgressUpdate, SessionMetrics,
    SessionResult, SessionStartOptions, SessionStatus, ToolExecution, ValidationReport,
};

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    SessionStarted,
    SessionProgress,
    SessionCompleted,
    PhaseTransition,
    ToolExecutionStarted,
    ToolExecutionCompleted,
    FileOperation,
    CostUpdate,
    Validation,
    Error,
}

impl EventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session-started",
            Self::SessionProgress => "session-progress",
            Self::SessionCompleted => "session-completed",
            Self::PhaseTransition => "phase-transition",
            Self::ToolExecutionStarted => "tool-execution-started",
            Self::ToolExecutionCompleted => "tool-execution-completed",
            Self::FileOperation => "file-operation",
            Self::CostUpdate => "cost-update",
            Self::Validation => "validation",
            Self::Error => "error",
        }
    }

    /// Critical events bypass bus buffering: the queue is drained and the
    /// event delivered immediately.
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::SessionCompleted | Self::Error)
    }

    pub const fn all() -> &'static [EventKind] {
        &[
            EventKind::SessionStarted,
            EventKind::SessionProgress,
            EventKind::SessionCompleted,
            EventKind::PhaseTransition,
            EventKind::ToolExecutionStarted,
            EventKind::ToolExecutionCompleted,
            EventKind::FileOperation,
            EventKind::CostUpdate,
            EventKind::Validation,
            EventKind::Error,
        ]
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EventKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown event kind: {value}"))
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStarted {
        options: SessionStartOptions,
    },
    /// Counters folded into the session snapshot. The tracker persists these
    /// through its snapshot buffer rather than publishing them.
    SessionProgress(ProgressUpdate),
    SessionCompleted {
        status: SessionStatus,
        result: SessionResult,
        metrics: SessionMetrics,
        started_at: DateTime<Utc>,
        /// Set when the publisher has already written the final session record.
        #[serde(default)]
        record_saved: bool,
    },
    PhaseTransition(PhaseTransition),
    ToolExecutionStarted {
        tool_name: String,
        params: serde_json::Value,
    },
    ToolExecutionCompleted(ToolExecution),
    FileOperation(FileOperation),
    CostUpdate {
        update: CostUpdate,
        total_cost: f64,
    },
    Validation(ValidationReport),
    Error(ErrorReport),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SessionStarted { .. } => EventKind::SessionStarted,
            Self::SessionProgress(_) => EventKind::SessionProgress,
            Self::SessionCompleted { .. } => EventKind::SessionCompleted,
            Self::PhaseTransition(_) => EventKind::PhaseTransition,
            Self::ToolExecutionStarted { .. } => EventKind::ToolExecutionStarted,
            Self::ToolExecutionCompleted(_) => EventKind::ToolExecutionCompleted,
            Self::FileOperation(_) => EventKind::FileOperation,
            Self::CostUpdate { .. } => EventKind::CostUpdate,
            Self::Validation(_) => EventKind::Validation,
            Self::Error(_) => EventKind::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: String,
    /// Assigned by the bus on publish; zero until then.
    pub seq: i64,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    pub fn new(
        session_id: impl Into<String>,
        conversation_id: Option<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            seq: 0,
            kind: payload.kind(),
            payload,
            session_id: session_id.into(),
            conversation_id,
            timestamp: Utc::now(),
        }
    }
}
