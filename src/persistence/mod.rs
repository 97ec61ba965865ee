//! Asynchronous persistence of bus events.

mod consumer;

#[cfg(test)]
mod tests;

use serde_json::json;

pub(crate) use consumer::persist_event;
pub use consumer::{EventMetadata, EventPersistenceConsumer, EventPriority, ProcessingStats};

use crate::bus::{AgentEvent, EventPayload};
use crate::core::ToolExecution;
use crate::storage::StorageError;

/// The result document stored alongside a tool execution.
pub(crate) fn tool_outcome(execution: &ToolExecution) -> serde_json::Value {
    json!({
        "success": execution.success,
        "output": execution.result,
        "error": execution.error,
    })
}

/// Reject payloads no storage backend could accept. These are never retried.
pub(crate) fn validate_event(event: &AgentEvent) -> Result<(), StorageError> {
    if event.session_id.trim().is_empty() {
        return Err(StorageError::Validation(format!(
            "{} event {} has no session id",
            event.kind, event.id
        )));
    }
    match &event.payload {
        EventPayload::ToolExecutionStarted { tool_name, .. } if tool_name.trim().is_empty() => {
            Err(StorageError::Validation("tool name must not be empty".to_string()))
        }
        EventPayload::ToolExecutionCompleted(execution) if execution.tool_name.trim().is_empty() => {
            Err(StorageError::Validation("tool name must not be empty".to_string()))
        }
        EventPayload::FileOperation(op) if op.path.trim().is_empty() => {
            Err(StorageError::Validation("file path must not be empty".to_string()))
        }
        EventPayload::CostUpdate { update, total_cost }
            if !update.cost_delta.is_finite() || !total_cost.is_finite() =>
        {
            Err(StorageError::Validation("cost must be a finite number".to_string()))
        }
        _ => Ok(()),
    }
}
