use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Phases and statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Exploration,
    Delegation,
    Completion,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Exploration
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Exploration => "exploration",
            Self::Delegation => "delegation",
            Self::Completion => "completion",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Phase {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exploration" => Ok(Self::Exploration),
            "delegation" => Ok(Self::Delegation),
            "completion" => Ok(Self::Completion),
            _ => Err(format!("unknown phase: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tracking inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStartOptions {
    pub conversation_id: Option<String>,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub success: bool,
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl SessionResult {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: Some(summary.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: None,
            error: Some(error.into()),
        }
    }
}

/// Partial metrics reported by the control loop. `None` fields are left as is.
///
/// Counters only move forward: a lower value than the stored one is ignored
/// unless `reset` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub iteration_count: Option<u64>,
    pub tool_call_count: Option<u64>,
    pub tokens_used: Option<u64>,
    pub current_phase: Option<Phase>,
    #[serde(default)]
    pub reset: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub reason: Option<String>,
    /// Time spent in `from` before the transition.
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl PhaseTransition {
    pub fn new(from: Phase, to: Phase, duration_ms: u64) -> Self {
        Self {
            from,
            to,
            reason: None,
            duration_ms,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub tool_name: String,
    pub params: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperationKind {
    Read,
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOperation {
    pub path: String,
    pub kind: FileOperationKind,
    pub bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostUpdate {
    /// Incremental cost in USD since the previous update.
    pub cost_delta: f64,
    pub tokens_delta: u64,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub checks: Vec<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    pub source: Option<String>,
    pub recoverable: bool,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub iteration_count: u64,
    pub tool_call_count: u64,
    pub total_cost: f64,
    pub tokens_used: u64,
    pub files_modified: BTreeSet<String>,
    pub files_created: BTreeSet<String>,
    pub phase_transitions: Vec<PhaseTransition>,
    pub current_phase: Phase,
    pub error_count: u64,
}

impl SessionMetrics {
    pub fn apply_progress(&mut self, update: &ProgressUpdate) {
        if update.reset {
            if let Some(v) = update.iteration_count {
                self.iteration_count = v;
            }
            if let Some(v) = update.tool_call_count {
                self.tool_call_count = v;
            }
            if let Some(v) = update.tokens_used {
                self.tokens_used = v;
            }
        } else {
            if let Some(v) = update.iteration_count {
                self.iteration_count = self.iteration_count.max(v);
            }
            if let Some(v) = update.tool_call_count {
                self.tool_call_count = self.tool_call_count.max(v);
            }
            if let Some(v) = update.tokens_used {
                self.tokens_used = self.tokens_used.max(v);
            }
        }
        if let Some(phase) = update.current_phase {
            self.current_phase = phase;
        }
    }

    pub fn apply_cost(&mut self, cost: &CostUpdate) {
        if cost.cost_delta > 0.0 {
            self.total_cost += cost.cost_delta;
        }
        self.tokens_used = self.tokens_used.saturating_add(cost.tokens_delta);
    }

    pub fn apply_file_operation(&mut self, op: &FileOperation) {
        match op.kind {
            FileOperationKind::Create => {
                self.files_created.insert(op.path.clone());
            }
            FileOperationKind::Modify => {
                self.files_modified.insert(op.path.clone());
            }
            FileOperationKind::Read | FileOperationKind::Delete => {}
        }
    }
}

/// What `save_agent_session` persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSessionRecord {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub status: SessionStatus,
    pub metrics: SessionMetrics,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_counters_never_go_backwards() {
        let mut metrics = SessionMetrics::default();
        metrics.apply_progress(&ProgressUpdate {
            iteration_count: Some(5),
            tokens_used: Some(1200),
            ..Default::default()
        });
        metrics.apply_progress(&ProgressUpdate {
            iteration_count: Some(3),
            ..Default::default()
        });
        assert_eq!(metrics.iteration_count, 5);
        assert_eq!(metrics.tokens_used, 1200);

        metrics.apply_progress(&ProgressUpdate {
            iteration_count: Some(1),
            reset: true,
            ..Default::default()
        });
        assert_eq!(metrics.iteration_count, 1);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }
}
