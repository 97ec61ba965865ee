//! Shared domain types passed by value between the bus, the tracker and storage.

pub mod conversation;
pub mod ring;
pub mod session;

pub use conversation::{ConversationFilter, ConversationMessage, ConversationState};
pub use ring::RingBuffer;
pub use session::{
    AgentSessionRecord, CostUpdate, ErrorReport, FileOperation, FileOperationKind, Phase,
    PhaseTransition, ProgressUpdate, SessionMetrics, SessionResult, SessionStartOptions,
    SessionStatus, ToolExecution, ValidationReport,
};
