//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the scheduler, storage,
//! retry backoff, and the fleet of policies and agents to seed.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::{Fleet, FleetBuilder};
pub use error::ConfigError;
pub use types::{
    AgentConfig, GlobalConfig, PolicyConfig, RetryConfig, SchedulerConfig, StorageConfig,
};
pub use yaml::YamlLoader;
