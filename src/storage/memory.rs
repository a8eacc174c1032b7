//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use super::{AckOutcome, PolicyTaskState, Storage, StorageError, TaskFilter};
use crate::core::policy::{Agent, Policy};
use crate::core::task::{Task, TaskStatus};
use crate::core::types::{AgentId, PolicyId, TaskId, TaskType};

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
///
/// Tasks are kept in insertion order so that claims with equal
/// `scheduled_for` and `created_at` are still handed out deterministically.
pub struct InMemoryStorage {
    policies: RwLock<HashMap<PolicyId, Policy>>,
    agents: RwLock<HashMap<AgentId, Agent>>,
    assignments: RwLock<HashMap<PolicyId, BTreeSet<AgentId>>>,
    states: RwLock<HashMap<(PolicyId, TaskType), PolicyTaskState>>,
    tasks: RwLock<Vec<Task>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            tasks: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_by_schedule(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.scheduled_for
            .cmp(&b.scheduled_for)
            .then(a.created_at.cmp(&b.created_at))
    });
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn upsert_policy(&self, policy: Policy) -> Result<(), StorageError> {
        let mut policies = self
            .policies
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        policies.insert(policy.id, policy);
        Ok(())
    }

    async fn get_policy(&self, id: &PolicyId) -> Result<Policy, StorageError> {
        let policies = self
            .policies
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        policies
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("policy: {}", id)))
    }

    async fn list_policies(&self) -> Result<Vec<Policy>, StorageError> {
        let policies = self
            .policies
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = policies.values().cloned().collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn list_enabled_policies(&self) -> Result<Vec<Policy>, StorageError> {
        let mut result = self.list_policies().await?;
        result.retain(|p| p.enabled);
        Ok(result)
    }

    async fn upsert_agent(&self, agent: Agent) -> Result<(), StorageError> {
        let mut agents = self.agents.write().map_err(|_| StorageError::LockPoisoned)?;
        match agents.get_mut(&agent.id) {
            Some(existing) => {
                existing.hostname = agent.hostname;
                existing.max_concurrent_tasks = agent.max_concurrent_tasks;
            }
            None => {
                agents.insert(agent.id, agent);
            }
        }
        Ok(())
    }

    async fn get_agent(&self, id: &AgentId) -> Result<Agent, StorageError> {
        let agents = self.agents.read().map_err(|_| StorageError::LockPoisoned)?;
        agents
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("agent: {}", id)))
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StorageError> {
        let agents = self.agents.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = agents.values().cloned().collect();
        result.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(result)
    }

    async fn assign_policy(
        &self,
        policy_id: &PolicyId,
        agent_id: &AgentId,
    ) -> Result<(), StorageError> {
        self.get_policy(policy_id).await?;
        self.get_agent(agent_id).await?;

        let mut assignments = self
            .assignments
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        assignments.entry(*policy_id).or_default().insert(*agent_id);
        Ok(())
    }

    async fn unassign_policy(
        &self,
        policy_id: &PolicyId,
        agent_id: &AgentId,
    ) -> Result<(), StorageError> {
        let mut assignments = self
            .assignments
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if let Some(agent_ids) = assignments.get_mut(policy_id) {
            agent_ids.remove(agent_id);
            if agent_ids.is_empty() {
                assignments.remove(policy_id);
            }
        }
        Ok(())
    }

    async fn get_policy_agents(&self, policy_id: &PolicyId) -> Result<Vec<Agent>, StorageError> {
        let agent_ids: Vec<AgentId> = {
            let assignments = self
                .assignments
                .read()
                .map_err(|_| StorageError::LockPoisoned)?;
            assignments
                .get(policy_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        };

        let agents = self.agents.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = agent_ids
            .iter()
            .filter_map(|id| agents.get(id).cloned())
            .collect();
        result.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(result)
    }

    async fn update_agent_backoff(
        &self,
        agent_id: &AgentId,
        tasks_in_backoff: u32,
        earliest_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut agents = self.agents.write().map_err(|_| StorageError::LockPoisoned)?;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| StorageError::NotFound(format!("agent: {}", agent_id)))?;
        agent.tasks_in_backoff = tasks_in_backoff;
        agent.earliest_retry_at = earliest_retry_at;
        Ok(())
    }

    async fn get_policy_task_state(
        &self,
        policy_id: &PolicyId,
        task_type: TaskType,
    ) -> Result<Option<PolicyTaskState>, StorageError> {
        let states = self.states.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(states.get(&(*policy_id, task_type)).cloned())
    }

    async fn seed_policy_task_state(
        &self,
        state: PolicyTaskState,
    ) -> Result<PolicyTaskState, StorageError> {
        let mut states = self.states.write().map_err(|_| StorageError::LockPoisoned)?;
        let key = (state.policy_id, state.task_type);
        let stored = states.entry(key).or_insert_with(|| state.clone());
        if stored.next_run.is_none() {
            stored.next_run = state.next_run;
            stored.updated_at = state.updated_at;
        }
        Ok(stored.clone())
    }

    async fn save_policy_task_state(&self, state: PolicyTaskState) -> Result<(), StorageError> {
        let mut states = self.states.write().map_err(|_| StorageError::LockPoisoned)?;
        states.insert((state.policy_id, state.task_type), state);
        Ok(())
    }

    async fn list_policy_task_states(&self) -> Result<Vec<PolicyTaskState>, StorageError> {
        let states = self.states.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = states.values().cloned().collect();
        result.sort_by(|a, b| {
            a.policy_id
                .cmp(&b.policy_id)
                .then(a.task_type.cmp(&b.task_type))
        });
        Ok(result)
    }

    async fn create_task(&self, task: Task) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        if tasks.iter().any(|t| t.id == task.id) {
            return Err(StorageError::DuplicateKey(format!("task: {}", task.id)));
        }
        tasks.push(task);
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Task, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        tasks
            .iter()
            .find(|t| &t.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = tasks.iter().filter(|t| filter.matches(t)).cloned().collect();
        sort_by_schedule(&mut result);
        Ok(result)
    }

    async fn claim_pending_tasks(
        &self,
        agent_id: &AgentId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError> {
        // Selection and update happen under one write lock.
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;

        let mut candidates: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| &t.agent_id == agent_id && t.is_claimable(now))
            .map(|(index, _)| index)
            .collect();
        candidates.sort_by(|&a, &b| {
            tasks[a]
                .scheduled_for
                .cmp(&tasks[b].scheduled_for)
                .then(tasks[a].created_at.cmp(&tasks[b].created_at))
        });
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for index in candidates {
            let task = &mut tasks[index];
            task.mark_assigned(now)
                .map_err(|e| StorageError::Other(e.to_string()))?;
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn acknowledge_task(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<AckOutcome, StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let Some(task) = tasks
            .iter_mut()
            .find(|t| &t.id == task_id && &t.agent_id == agent_id)
        else {
            return Ok(AckOutcome::NotFound);
        };

        match task.status {
            TaskStatus::Assigned => {
                task.mark_acknowledged(now)
                    .map_err(|e| StorageError::Other(e.to_string()))?;
                Ok(AckOutcome::Acknowledged)
            }
            TaskStatus::InProgress => Ok(AckOutcome::AlreadyAcknowledged),
            other => Ok(AckOutcome::InvalidStatus(other)),
        }
    }

    async fn update_task(&self, task: Task, expected: TaskStatus) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let stored = tasks
            .iter_mut()
            .find(|t| t.id == task.id)
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", task.id)))?;

        if stored.status != expected {
            return Err(StorageError::Conflict(format!(
                "task {} is {}, expected {}",
                task.id, stored.status, expected
            )));
        }
        *stored = task;
        Ok(())
    }

    async fn list_backoff_tasks(
        &self,
        agent_id: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = tasks
            .iter()
            .filter(|t| &t.agent_id == agent_id && t.is_in_backoff(now))
            .cloned()
            .collect();
        result.sort_by_key(|t| t.next_retry_at);
        Ok(result)
    }
}
