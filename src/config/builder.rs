//! Fleet builder from YAML configuration.
//!
//! This module converts the configured policies and agents into domain
//! records and registers them with a storage backend.

use std::collections::HashSet;

use crate::core::policy::{Agent, Policy};
use crate::core::types::{AgentId, PolicyId};
use crate::storage::Storage;

use super::error::ConfigError;
use super::types::{AgentConfig, GlobalConfig, PolicyConfig};

/// Policies, agents and their assignments, ready to be stored.
#[derive(Debug, Clone)]
pub struct Fleet {
    pub policies: Vec<Policy>,
    pub agents: Vec<Agent>,
    pub assignments: Vec<(PolicyId, AgentId)>,
}

impl Fleet {
    /// Upsert every policy and agent, record the assignments, then reconcile
    /// the store with this fleet.
    ///
    /// Ids are derived from names, so seeding the same configuration into a
    /// persistent store again updates records in place. Stored policies that
    /// are not part of the fleet are disabled, and any assignment the fleet
    /// does not list is removed.
    pub async fn seed<S: Storage + ?Sized>(&self, storage: &S) -> Result<(), ConfigError> {
        for agent in &self.agents {
            storage.upsert_agent(agent.clone()).await?;
        }
        for policy in &self.policies {
            storage.upsert_policy(policy.clone()).await?;
        }
        for (policy_id, agent_id) in &self.assignments {
            storage.assign_policy(policy_id, agent_id).await?;
        }

        let (disabled, unassigned) = self.reconcile(storage).await?;

        tracing::info!(
            policies = self.policies.len(),
            agents = self.agents.len(),
            assignments = self.assignments.len(),
            disabled,
            unassigned,
            "Fleet seeded"
        );
        Ok(())
    }

    /// Returns how many policies were disabled and assignments removed.
    async fn reconcile<S: Storage + ?Sized>(
        &self,
        storage: &S,
    ) -> Result<(usize, usize), ConfigError> {
        let configured: HashSet<PolicyId> = self.policies.iter().map(|p| p.id).collect();
        let assigned: HashSet<(PolicyId, AgentId)> = self.assignments.iter().copied().collect();
        let mut disabled = 0;
        let mut unassigned = 0;

        for policy in storage.list_policies().await? {
            let policy_id = policy.id;
            if policy.enabled && !configured.contains(&policy_id) {
                tracing::info!(
                    policy_id = %policy_id,
                    policy = %policy.name,
                    "Disabling policy missing from configuration"
                );
                storage.upsert_policy(policy.with_enabled(false)).await?;
                disabled += 1;
            }

            unassigned += Self::drop_stale_assignments(storage, &policy_id, &assigned).await?;
        }

        Ok((disabled, unassigned))
    }

    async fn drop_stale_assignments<S: Storage + ?Sized>(
        storage: &S,
        policy_id: &PolicyId,
        assigned: &HashSet<(PolicyId, AgentId)>,
    ) -> Result<usize, ConfigError> {
        let mut removed = 0;
        for agent in storage.get_policy_agents(policy_id).await? {
            if !assigned.contains(&(*policy_id, agent.id)) {
                tracing::info!(
                    policy_id = %policy_id,
                    agent_id = %agent.id,
                    hostname = %agent.hostname,
                    "Removing assignment missing from configuration"
                );
                storage.unassign_policy(policy_id, &agent.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Builder for creating a [`Fleet`] from configuration.
pub struct FleetBuilder;

impl FleetBuilder {
    /// Build the fleet described by a validated configuration.
    pub fn build(config: &GlobalConfig) -> Result<Fleet, ConfigError> {
        let agents: Vec<Agent> = config.agents.iter().map(Self::build_agent).collect();

        let mut policies = Vec::with_capacity(config.policies.len());
        let mut assignments = Vec::new();
        for policy_config in &config.policies {
            let policy = Self::build_policy(policy_config);

            for hostname in &policy_config.agents {
                let agent = agents
                    .iter()
                    .find(|a| &a.hostname == hostname)
                    .ok_or_else(|| {
                        ConfigError::InvalidConfig(format!(
                            "policy '{}' references unknown agent '{}'",
                            policy.name, hostname
                        ))
                    })?;
                assignments.push((policy.id, agent.id));
            }

            policies.push(policy);
        }

        Ok(Fleet {
            policies,
            agents,
            assignments,
        })
    }

    fn build_agent(config: &AgentConfig) -> Agent {
        let agent = Agent::new(&config.hostname);
        match config.max_concurrent_tasks {
            Some(max) => agent.with_max_concurrent_tasks(max),
            None => agent,
        }
    }

    fn build_policy(config: &PolicyConfig) -> Policy {
        let mut policy = Policy::new(&config.name, &config.schedule)
            .with_enabled(config.enabled)
            .with_repository(&config.repository)
            .with_include_paths(&config.include_paths)
            .with_exclude_paths(&config.exclude_paths)
            .with_retention(config.retention.clone())
            .with_max_retries(config.max_retries);
        policy.check_schedule = config.check_schedule.clone();
        policy.prune_schedule = config.prune_schedule.clone();
        policy
    }
}
