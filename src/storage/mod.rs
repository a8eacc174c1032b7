//! Storage abstraction for policies, agents, schedule state and tasks.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite).
//!
//! Two operations carry the concurrency guarantees the rest of the crate
//! relies on: [`Storage::claim_pending_tasks`] never hands the same task to
//! two callers, and [`Storage::seed_policy_task_state`] /
//! [`Storage::save_policy_task_state`] never double-insert a state row.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::policy::{Agent, Policy};
use crate::core::task::{Task, TaskStatus};
use crate::core::types::{AgentId, PolicyId, TaskId, TaskType};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// A conditional update lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Scheduling cursor for one `(policy, task type)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTaskState {
    pub policy_id: PolicyId,
    pub task_type: TaskType,
    /// Most recent dispatch.
    pub last_run: Option<DateTime<Utc>>,
    /// The pair is due at or after this instant.
    pub next_run: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PolicyTaskState {
    /// Create an empty state row.
    pub fn new(policy_id: PolicyId, task_type: TaskType) -> Self {
        Self {
            policy_id,
            task_type,
            last_run: None,
            next_run: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_last_run(mut self, last_run: DateTime<Utc>) -> Self {
        self.last_run = Some(last_run);
        self
    }

    pub fn with_next_run(mut self, next_run: DateTime<Utc>) -> Self {
        self.next_run = Some(next_run);
        self
    }

    /// Due when `now` is at or after `next_run`. Unseeded state is never due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run.is_some_and(|next_run| now >= next_run)
    }
}

/// Filter for [`Storage::list_tasks`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub agent_id: Option<AgentId>,
    pub policy_id: Option<PolicyId>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
}

impl TaskFilter {
    /// Match all tasks.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn policy(mut self, policy_id: PolicyId) -> Self {
        self.policy_id = Some(policy_id);
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    /// Check a task against every set field.
    pub fn matches(&self, task: &Task) -> bool {
        self.agent_id.is_none_or(|id| task.agent_id == id)
            && self.policy_id.is_none_or(|id| task.policy_id == id)
            && self.status.is_none_or(|status| task.status == status)
            && self.task_type.is_none_or(|t| task.task_type == t)
    }
}

/// Result of [`Storage::acknowledge_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The task moved from assigned to in-progress.
    Acknowledged,
    /// The task was already in progress; nothing changed.
    AlreadyAcknowledged,
    /// No such task for this agent.
    NotFound,
    /// The task exists for this agent but cannot be acknowledged.
    InvalidStatus(TaskStatus),
}

/// Storage trait for persisting orchestrator state.
#[async_trait]
pub trait Storage: Send + Sync {
    // Policy operations

    /// Insert or replace a policy.
    async fn upsert_policy(&self, policy: Policy) -> Result<(), StorageError>;

    /// Get a policy by ID.
    async fn get_policy(&self, id: &PolicyId) -> Result<Policy, StorageError>;

    /// List all policies ordered by name.
    async fn list_policies(&self) -> Result<Vec<Policy>, StorageError>;

    /// List only enabled policies ordered by name.
    async fn list_enabled_policies(&self) -> Result<Vec<Policy>, StorageError>;

    // Agent operations

    /// Insert or update an agent. The derived backoff fields of an existing
    /// agent are kept.
    async fn upsert_agent(&self, agent: Agent) -> Result<(), StorageError>;

    /// Get an agent by ID.
    async fn get_agent(&self, id: &AgentId) -> Result<Agent, StorageError>;

    /// List all agents ordered by hostname.
    async fn list_agents(&self) -> Result<Vec<Agent>, StorageError>;

    /// Assign a policy to an agent. Assigning twice is a no-op.
    async fn assign_policy(
        &self,
        policy_id: &PolicyId,
        agent_id: &AgentId,
    ) -> Result<(), StorageError>;

    /// Remove an assignment. Removing one that does not exist is a no-op.
    async fn unassign_policy(
        &self,
        policy_id: &PolicyId,
        agent_id: &AgentId,
    ) -> Result<(), StorageError>;

    /// Agents currently assigned to a policy, ordered by hostname.
    async fn get_policy_agents(&self, policy_id: &PolicyId) -> Result<Vec<Agent>, StorageError>;

    /// Overwrite an agent's derived backoff aggregate.
    async fn update_agent_backoff(
        &self,
        agent_id: &AgentId,
        tasks_in_backoff: u32,
        earliest_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    // Policy task state operations

    /// Get the state row for a pair, if it exists.
    async fn get_policy_task_state(
        &self,
        policy_id: &PolicyId,
        task_type: TaskType,
    ) -> Result<Option<PolicyTaskState>, StorageError>;

    /// Store `state` only if the pair has no row or its row has no
    /// `next_run`, and return the row as stored afterwards.
    async fn seed_policy_task_state(
        &self,
        state: PolicyTaskState,
    ) -> Result<PolicyTaskState, StorageError>;

    /// Insert or replace the state row for a pair.
    async fn save_policy_task_state(&self, state: PolicyTaskState) -> Result<(), StorageError>;

    /// All state rows ordered by policy then task type.
    async fn list_policy_task_states(&self) -> Result<Vec<PolicyTaskState>, StorageError>;

    // Task operations

    /// Insert a new task.
    async fn create_task(&self, task: Task) -> Result<(), StorageError>;

    /// Get a task by ID.
    async fn get_task(&self, id: &TaskId) -> Result<Task, StorageError>;

    /// List tasks matching a filter, ordered by `scheduled_for` then `created_at`.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StorageError>;

    /// Atomically move up to `limit` claimable pending tasks of an agent to
    /// assigned, oldest `scheduled_for` first (ties broken by `created_at`).
    ///
    /// Tasks still inside their backoff window are skipped.
    async fn claim_pending_tasks(
        &self,
        agent_id: &AgentId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError>;

    /// Move an assigned task owned by `agent_id` to in-progress.
    async fn acknowledge_task(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<AckOutcome, StorageError>;

    /// Replace a task, but only while its stored status is still `expected`.
    ///
    /// Returns [`StorageError::Conflict`] when another writer moved it first.
    async fn update_task(&self, task: Task, expected: TaskStatus) -> Result<(), StorageError>;

    /// Pending tasks of an agent with `next_retry_at` after `now`, earliest first.
    async fn list_backoff_tasks(
        &self,
        agent_id: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError>;
}
