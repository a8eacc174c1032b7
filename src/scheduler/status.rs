//! Operator-facing scheduler status.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::metrics::MetricsSnapshot;
use crate::core::types::{PolicyId, TaskType};

/// One scheduled `(policy, task type)` pair and when it runs next.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcomingScheduleItem {
    pub policy_id: PolicyId,
    pub policy_name: String,
    pub task_type: TaskType,
    pub next_run: DateTime<Utc>,
    pub schedule: String,
}

/// Read model served by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub tasks_generated: u64,
    pub errors_total: u64,
    pub last_error: Option<String>,
    pub policies_enabled: usize,
    /// Sorted by `next_run`, soonest first.
    pub upcoming_schedule: Vec<UpcomingScheduleItem>,
    pub metrics: MetricsSnapshot,
}
