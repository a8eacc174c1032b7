use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::LifecycleError;
use super::backoff::AgentBackoff;
use crate::core::retry::BackoffPolicy;
use crate::core::task::{InvalidTransition, ResultOutcome, Task, TaskResult, TaskStatus};
use crate::core::types::{AgentId, TaskId};
use crate::storage::{AckOutcome, Storage, StorageError};

/// Body returned for a successful acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AckResponse {
    pub status: &'static str,
}

impl AckResponse {
    fn acknowledged() -> Self {
        Self {
            status: "acknowledged",
        }
    }
}

/// Drives tasks through claim, acknowledge and result submission.
pub struct TaskLifecycle<S: Storage> {
    storage: Arc<S>,
    backoff: BackoffPolicy,
}

impl<S: Storage> TaskLifecycle<S> {
    /// Create a lifecycle over shared storage with the default backoff.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Set the backoff used for retries.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Claim up to `limit` pending tasks for an agent.
    pub async fn claim_tasks(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> Result<Vec<Task>, LifecycleError> {
        self.claim_tasks_at(agent_id, limit, Utc::now()).await
    }

    /// Claim as of `now`. An empty result means no work, not an error.
    pub async fn claim_tasks_at(
        &self,
        agent_id: &AgentId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, LifecycleError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let tasks = self.storage.claim_pending_tasks(agent_id, limit, now).await?;
        for task in &tasks {
            tracing::info!(
                task_id = %task.id,
                agent_id = %agent_id,
                task_type = %task.task_type,
                retry_count = task.retry_count,
                "Task assigned"
            );
        }
        Ok(tasks)
    }

    /// Acknowledge a claimed task.
    pub async fn acknowledge(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
    ) -> Result<AckResponse, LifecycleError> {
        self.acknowledge_at(agent_id, task_id, Utc::now()).await
    }

    /// Acknowledge as of `now`.
    ///
    /// Acknowledging an in-progress task again succeeds without touching it.
    /// A task owned by another agent is reported as not found.
    pub async fn acknowledge_at(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<AckResponse, LifecycleError> {
        match self.storage.acknowledge_task(agent_id, task_id, now).await? {
            AckOutcome::Acknowledged => {
                tracing::info!(task_id = %task_id, agent_id = %agent_id, "Task acknowledged");
                Ok(AckResponse::acknowledged())
            }
            AckOutcome::AlreadyAcknowledged => {
                tracing::debug!(task_id = %task_id, agent_id = %agent_id, "Task already acknowledged");
                Ok(AckResponse::acknowledged())
            }
            AckOutcome::NotFound => Err(LifecycleError::NotFound(task_id.to_string())),
            AckOutcome::InvalidStatus(from) => Err(InvalidTransition {
                task_id: *task_id,
                from,
                to: TaskStatus::InProgress,
            }
            .into()),
        }
    }

    /// Record an agent's result for an in-progress task.
    pub async fn submit_result(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        result: TaskResult,
    ) -> Result<ResultOutcome, LifecycleError> {
        self.submit_result_at(agent_id, task_id, result, Utc::now())
            .await
    }

    /// Record a result as of `now`, then refresh the agent's backoff aggregate.
    pub async fn submit_result_at(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        result: TaskResult,
        now: DateTime<Utc>,
    ) -> Result<ResultOutcome, LifecycleError> {
        result.validate().map_err(LifecycleError::InvalidResult)?;

        let mut task = self.owned_task(agent_id, task_id).await?;
        let outcome = task.apply_result(&result, &self.backoff, now)?;

        match self.storage.update_task(task, TaskStatus::InProgress).await {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => {
                // Lost to a concurrent submission; report what it left behind.
                let current = self.owned_task(agent_id, task_id).await?;
                return Err(InvalidTransition {
                    task_id: *task_id,
                    from: current.status,
                    to: TaskStatus::Completed,
                }
                .into());
            }
            Err(StorageError::NotFound(_)) => {
                return Err(LifecycleError::NotFound(task_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        match outcome {
            ResultOutcome::Completed => {
                tracing::info!(task_id = %task_id, agent_id = %agent_id, "Task completed");
            }
            ResultOutcome::RetryScheduled {
                retry_count,
                next_retry_at,
            } => {
                tracing::info!(
                    task_id = %task_id,
                    agent_id = %agent_id,
                    retry_count,
                    next_retry_at = %next_retry_at,
                    "Task scheduled for retry"
                );
            }
            ResultOutcome::Failed { category } => {
                tracing::warn!(
                    task_id = %task_id,
                    agent_id = %agent_id,
                    category = %category,
                    "Task failed"
                );
            }
        }

        if let Err(e) = self.refresh_agent_backoff_at(agent_id, now).await {
            tracing::warn!(agent_id = %agent_id, error = %e, "Failed to refresh agent backoff");
        }

        Ok(outcome)
    }

    /// Recompute the agent's backoff aggregate and store it on the agent.
    pub async fn refresh_agent_backoff(
        &self,
        agent_id: &AgentId,
    ) -> Result<AgentBackoff, LifecycleError> {
        self.refresh_agent_backoff_at(agent_id, Utc::now()).await
    }

    pub async fn refresh_agent_backoff_at(
        &self,
        agent_id: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<AgentBackoff, LifecycleError> {
        let backoff = self.agent_backoff_at(agent_id, now).await?;
        self.storage
            .update_agent_backoff(agent_id, backoff.tasks_in_backoff, backoff.earliest_retry_at)
            .await?;
        Ok(backoff)
    }

    /// Read the agent's backoff view without storing it.
    pub async fn agent_backoff(&self, agent_id: &AgentId) -> Result<AgentBackoff, LifecycleError> {
        self.agent_backoff_at(agent_id, Utc::now()).await
    }

    pub async fn agent_backoff_at(
        &self,
        agent_id: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<AgentBackoff, LifecycleError> {
        let tasks = self.storage.list_backoff_tasks(agent_id, now).await?;
        Ok(AgentBackoff::from_tasks(*agent_id, &tasks, now))
    }

    async fn owned_task(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<Task, LifecycleError> {
        match self.storage.get_task(task_id).await {
            Ok(task) if task.agent_id == *agent_id => Ok(task),
            Ok(_) | Err(StorageError::NotFound(_)) => {
                Err(LifecycleError::NotFound(task_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
