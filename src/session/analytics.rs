use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{FileOperation, FileOperationKind, Phase, PhaseTransition, ToolExecution};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolStats {
    pub count: u64,
    pub successes: u64,
    pub total_time_ms: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

impl ToolStats {
    fn record(&mut self, duration_ms: u64, success: bool) {
        self.count += 1;
        if success {
            self.successes += 1;
        }
        self.total_time_ms = self.total_time_ms.saturating_add(duration_ms);
        let n = self.count as f64;
        self.average_duration_ms += (duration_ms as f64 - self.average_duration_ms) / n;
        self.success_rate = self.successes as f64 / n;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostPoint {
    pub timestamp: DateTime<Utc>,
    pub total_cost: f64,
    pub tokens_used: u64,
}

/// Paths touched during a session, grouped by operation kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileActivity {
    pub read: BTreeSet<String>,
    pub created: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl FileActivity {
    pub fn total(&self) -> usize {
        self.read.len() + self.created.len() + self.modified.len() + self.deleted.len()
    }
}

/// Derived per-session statistics, maintained incrementally by the tracker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionAnalytics {
    /// Milliseconds spent in each phase, credited to the phase being left.
    pub time_in_phase_ms: BTreeMap<Phase, u64>,
    pub tool_stats: BTreeMap<String, ToolStats>,
    pub cost_over_time: Vec<CostPoint>,
    pub file_activity: FileActivity,
}

impl SessionAnalytics {
    pub(crate) fn record_transition(&mut self, transition: &PhaseTransition) {
        let spent = self.time_in_phase_ms.entry(transition.from).or_insert(0);
        *spent = spent.saturating_add(transition.duration_ms);
    }

    pub(crate) fn record_tool(&mut self, execution: &ToolExecution) {
        self.tool_stats
            .entry(execution.tool_name.clone())
            .or_default()
            .record(execution.duration_ms, execution.success);
    }

    pub(crate) fn record_cost(&mut self, timestamp: DateTime<Utc>, total_cost: f64, tokens_used: u64) {
        self.cost_over_time.push(CostPoint {
            timestamp,
            total_cost,
            tokens_used,
        });
    }

    pub(crate) fn record_file(&mut self, operation: &FileOperation) {
        let paths = match operation.kind {
            FileOperationKind::Read => &mut self.file_activity.read,
            FileOperationKind::Create => &mut self.file_activity.created,
            FileOperationKind::Modify => &mut self.file_activity.modified,
            FileOperationKind::Delete => &mut self.file_activity.deleted,
        };
        paths.insert(operation.path.clone());
    }

    pub fn total_tool_calls(&self) -> u64 {
        self.tool_stats.values().map(|s| s.count).sum()
    }
}
