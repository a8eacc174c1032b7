//! Dispatchable tasks and their state machine.
//!
//! A task is a frozen copy of a policy's target at the moment it became due,
//! bound to one agent:
//!
//! ```text
//! pending -> assigned -> in-progress -> completed
//!    ^                        |
//!    +---- retry (backoff) ---+-------> failed
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::policy::{Policy, RetentionRules};
use super::retry::{BackoffPolicy, ErrorCategory, categorize_error, should_retry};
use super::types::{AgentId, PolicyId, TaskId, TaskType};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Waiting to be claimed (possibly inside a retry backoff window).
    Pending,
    /// Claimed by its agent, not yet acknowledged.
    Assigned,
    /// Acknowledged and running on the agent.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully with no retry budget left.
    Failed,
}

impl TaskStatus {
    /// Stable name, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Completed and failed tasks never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "in-progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// A state change that the task's current status does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task {task_id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Outcome reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    #[serde(alias = "completed")]
    Success,
    #[serde(alias = "failed")]
    Failure,
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" | "completed" => Ok(ResultStatus::Success),
            "failure" | "failed" => Ok(ResultStatus::Failure),
            other => Err(format!("unknown result status: {}", other)),
        }
    }
}

/// Execution result submitted by an agent for an in-progress task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: ResultStatus,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskResult {
    /// A successful run.
    pub fn success(duration_seconds: f64) -> Self {
        Self {
            status: ResultStatus::Success,
            duration_seconds,
            snapshot_id: None,
            error_message: None,
        }
    }

    /// A failed run with the agent's error message.
    pub fn failure(duration_seconds: f64, error_message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            duration_seconds,
            snapshot_id: None,
            error_message: Some(error_message.into()),
        }
    }

    pub fn with_snapshot_id(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    /// Check the fields an agent controls.
    pub fn validate(&self) -> Result<(), String> {
        if !self.duration_seconds.is_finite() || self.duration_seconds < 0.0 {
            return Err(format!(
                "duration_seconds must be a non-negative number, got {}",
                self.duration_seconds
            ));
        }
        Ok(())
    }
}

/// What applying a result did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    /// The task finished successfully.
    Completed,
    /// The task went back to pending until `next_retry_at`.
    RetryScheduled {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// The task failed for good.
    Failed { category: ErrorCategory },
}

/// One unit of work for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub policy_id: PolicyId,
    pub task_type: TaskType,
    pub status: TaskStatus,

    pub repository: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub retention: RetentionRules,

    pub scheduled_for: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
    pub snapshot_id: Option<String>,

    pub retry_count: u32,
    pub max_retries: u32,
    /// Only meaningful while pending.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error_category: Option<ErrorCategory>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Freeze a policy's current target into a pending task for one agent.
    pub fn from_policy(
        policy: &Policy,
        agent_id: AgentId,
        task_type: TaskType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            agent_id,
            policy_id: policy.id,
            task_type,
            status: TaskStatus::Pending,
            repository: policy.repository.clone(),
            include_paths: policy.include_paths.clone(),
            exclude_paths: policy.exclude_paths.clone(),
            retention: policy.retention.clone(),
            scheduled_for: now,
            assigned_at: None,
            acknowledged_at: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            duration_seconds: None,
            snapshot_id: None,
            retry_count: 0,
            max_retries: policy.max_retries,
            next_retry_at: None,
            last_error_category: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Retries left before a failure becomes terminal.
    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Pending but not claimable until `next_retry_at`.
    pub fn is_in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_retry_at.is_some_and(|at| at > now)
    }

    /// Pending and outside any backoff window.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && !self.is_in_backoff(now)
    }

    fn transition_error(&self, to: TaskStatus) -> InvalidTransition {
        InvalidTransition {
            task_id: self.id,
            from: self.status,
            to,
        }
    }

    /// pending -> assigned.
    pub fn mark_assigned(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != TaskStatus::Pending {
            return Err(self.transition_error(TaskStatus::Assigned));
        }
        self.status = TaskStatus::Assigned;
        self.assigned_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// assigned -> in-progress.
    pub fn mark_acknowledged(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != TaskStatus::Assigned {
            return Err(self.transition_error(TaskStatus::InProgress));
        }
        self.status = TaskStatus::InProgress;
        self.acknowledged_at = Some(now);
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// in-progress -> completed | failed | pending (retry).
    ///
    /// A failure with retry budget left and no permanent marker re-enters
    /// pending with `next_retry_at = now + backoff(retry_count)`; the
    /// assignment timestamps are cleared so the next claim starts fresh.
    pub fn apply_result(
        &mut self,
        result: &TaskResult,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<ResultOutcome, InvalidTransition> {
        if self.status != TaskStatus::InProgress {
            let to = match result.status {
                ResultStatus::Success => TaskStatus::Completed,
                ResultStatus::Failure => TaskStatus::Failed,
            };
            return Err(self.transition_error(to));
        }

        self.duration_seconds = Some(result.duration_seconds);
        self.snapshot_id = result.snapshot_id.clone();
        self.updated_at = now;

        match result.status {
            ResultStatus::Success => {
                self.status = TaskStatus::Completed;
                self.completed_at = Some(now);
                self.error_message = None;
                self.retry_count = 0;
                self.next_retry_at = None;
                self.last_error_category = None;
                Ok(ResultOutcome::Completed)
            }
            ResultStatus::Failure => {
                let message = result.error_message.clone().unwrap_or_default();
                let category = categorize_error(&message);
                let retry = should_retry(self.retry_count, self.max_retries, &message);
                self.error_message = Some(message);
                self.last_error_category = Some(category);

                if retry {
                    self.retry_count += 1;
                    let delay = TimeDelta::from_std(backoff.delay_for(self.retry_count))
                        .unwrap_or(TimeDelta::MAX);
                    let next_retry_at = now
                        .checked_add_signed(delay)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);

                    self.status = TaskStatus::Pending;
                    self.next_retry_at = Some(next_retry_at);
                    self.assigned_at = None;
                    self.acknowledged_at = None;
                    self.started_at = None;

                    Ok(ResultOutcome::RetryScheduled {
                        retry_count: self.retry_count,
                        next_retry_at,
                    })
                } else {
                    self.status = TaskStatus::Failed;
                    self.completed_at = Some(now);
                    self.next_retry_at = None;
                    Ok(ResultOutcome::Failed { category })
                }
            }
        }
    }
}
