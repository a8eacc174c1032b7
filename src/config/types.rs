//! Configuration type definitions.
//!
//! This module contains the type definitions for the YAML configuration:
//! scheduler timing, storage backend, retry backoff, agents and policies.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::policy::{Policy, RetentionRules};
use crate::core::retry::BackoffPolicy;

/// Global configuration (bosun.yaml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Scheduler loop settings.
    pub scheduler: SchedulerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Backoff applied to failed tasks.
    pub retry: RetryConfig,
    /// Agents to register.
    pub agents: Vec<AgentConfig>,
    /// Policies to register.
    pub policies: Vec<PolicyConfig>,
}

/// Scheduler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Retry backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in seconds.
    pub base_delay_secs: u64,
    /// Ceiling for exponential growth, in seconds.
    pub max_delay_secs: u64,
    /// Growth factor between consecutive retries.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            max_delay_secs: 300,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Convert to the backoff policy used by the task lifecycle.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.base_delay_secs),
            Duration::from_secs(self.max_delay_secs),
            self.multiplier,
        )
    }
}

/// An agent to register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub hostname: String,
    /// Upper bound on concurrently running tasks, for admission control.
    pub max_concurrent_tasks: Option<u32>,
}

/// A policy to register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Unique policy name. The policy id is derived from it.
    pub name: String,
    /// Whether the policy is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Backup schedule (cron or `every <n>[hm]`).
    pub schedule: String,
    pub check_schedule: Option<String>,
    pub prune_schedule: Option<String>,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub retention: RetentionRules,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Hostnames of the agents this policy is assigned to.
    #[serde(default)]
    pub agents: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    Policy::DEFAULT_MAX_RETRIES
}
