//! Per-agent view of tasks waiting out a retry delay.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::retry::ErrorCategory;
use crate::core::task::Task;
use crate::core::types::{AgentId, TaskId, TaskType};

/// One task inside its backoff window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffTask {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: DateTime<Utc>,
    pub error_category: Option<ErrorCategory>,
}

/// Backoff aggregate for one agent.
///
/// `tasks_in_backoff` and `earliest_retry_at` are always derived from
/// `tasks`, never tracked separately.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentBackoff {
    pub agent_id: AgentId,
    pub tasks_in_backoff: u32,
    pub earliest_retry_at: Option<DateTime<Utc>>,
    pub tasks: Vec<BackoffTask>,
}

impl AgentBackoff {
    /// Aggregate the tasks of `agent_id` that are pending with a retry after `now`.
    ///
    /// Tasks of other agents and tasks outside a backoff window are ignored.
    pub fn from_tasks(agent_id: AgentId, tasks: &[Task], now: DateTime<Utc>) -> Self {
        let mut tasks: Vec<BackoffTask> = tasks
            .iter()
            .filter(|t| t.agent_id == agent_id && t.is_in_backoff(now))
            .filter_map(|t| {
                t.next_retry_at.map(|next_retry_at| BackoffTask {
                    task_id: t.id,
                    task_type: t.task_type,
                    retry_count: t.retry_count,
                    max_retries: t.max_retries,
                    next_retry_at,
                    error_category: t.last_error_category,
                })
            })
            .collect();
        tasks.sort_by_key(|t| t.next_retry_at);

        Self {
            agent_id,
            tasks_in_backoff: u32::try_from(tasks.len()).unwrap_or(u32::MAX),
            earliest_retry_at: tasks.first().map(|t| t.next_retry_at),
            tasks,
        }
    }

    /// True when nothing is waiting to be retried.
    pub fn is_clear(&self) -> bool {
        self.tasks.is_empty()
    }
}
