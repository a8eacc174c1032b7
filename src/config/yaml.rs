//! YAML configuration parsing.
//!
//! Parses and validates the global configuration file.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{GlobalConfig, PolicyConfig, StorageConfig};
use crate::core::schedule::Schedule;

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load and validate global configuration from a file.
    pub fn load_global_config(path: impl AsRef<Path>) -> Result<GlobalConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_global_config(&content)
    }

    /// Parse and validate global configuration from a YAML string.
    pub fn parse_global_config(yaml: &str) -> Result<GlobalConfig, ConfigError> {
        let config: GlobalConfig = serde_yaml::from_str(yaml)?;
        Self::validate_global_config(&config)?;
        Ok(config)
    }

    /// Validate a global configuration.
    pub fn validate_global_config(config: &GlobalConfig) -> Result<(), ConfigError> {
        if config.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "scheduler.tick_interval_secs cannot be zero".into(),
            ));
        }

        if let StorageConfig::Sqlite { path } = &config.storage {
            if path.trim().is_empty() {
                return Err(ConfigError::MissingField("storage.path".into()));
            }
        }

        let retry = &config.retry;
        if retry.base_delay_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.base_delay_secs cannot be zero".into(),
            ));
        }
        if retry.max_delay_secs < retry.base_delay_secs {
            return Err(ConfigError::InvalidConfig(
                "retry.max_delay_secs must be at least retry.base_delay_secs".into(),
            ));
        }
        // Also rejects NaN.
        if !(retry.multiplier > 1.0 && retry.multiplier.is_finite()) {
            return Err(ConfigError::InvalidConfig(format!(
                "retry.multiplier must be greater than 1, got {}",
                retry.multiplier
            )));
        }

        let mut hostnames = HashSet::new();
        for agent in &config.agents {
            if agent.hostname.trim().is_empty() {
                return Err(ConfigError::MissingField("agents[].hostname".into()));
            }
            if agent.max_concurrent_tasks == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "agent '{}': max_concurrent_tasks cannot be zero",
                    agent.hostname
                )));
            }
            if !hostnames.insert(agent.hostname.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate agent hostname: {}",
                    agent.hostname
                )));
            }
        }

        let mut names = HashSet::new();
        for policy in &config.policies {
            Self::validate_policy(policy, &hostnames)?;
            if !names.insert(policy.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate policy name: {}",
                    policy.name
                )));
            }
        }

        Ok(())
    }

    fn validate_policy(policy: &PolicyConfig, hostnames: &HashSet<&str>) -> Result<(), ConfigError> {
        if policy.name.trim().is_empty() {
            return Err(ConfigError::MissingField("policies[].name".into()));
        }

        Schedule::parse(policy.schedule.as_str()).map_err(|e| {
            ConfigError::InvalidConfig(format!("policy '{}': schedule: {}", policy.name, e))
        })?;

        let optional = [
            ("check_schedule", &policy.check_schedule),
            ("prune_schedule", &policy.prune_schedule),
        ];
        for (field, schedule) in optional {
            if let Some(schedule) = schedule.as_deref().filter(|s| !s.trim().is_empty()) {
                Schedule::parse(schedule).map_err(|e| {
                    ConfigError::InvalidConfig(format!("policy '{}': {}: {}", policy.name, field, e))
                })?;
            }
        }

        let mut seen = HashSet::new();
        for hostname in &policy.agents {
            if !hostnames.contains(hostname.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "policy '{}' references unknown agent '{}'",
                    policy.name, hostname
                )));
            }
            if !seen.insert(hostname) {
                return Err(ConfigError::InvalidConfig(format!(
                    "policy '{}' lists agent '{}' twice",
                    policy.name, hostname
                )));
            }
        }

        Ok(())
    }
}
