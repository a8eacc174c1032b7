//! Core identifier types for the orchestrator.
//!
//! These types provide type-safe identifiers for policies, agents and tasks,
//! plus the closed set of task types a policy can schedule.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Derive a stable identifier from a name.
            ///
            /// The same name always maps to the same identifier, which lets
            /// configuration-defined records keep their identity across restarts.
            pub fn from_name(name: &str) -> Self {
                Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a backup policy.
    PolicyId
);

uuid_id!(
    /// Unique identifier for a registered agent.
    AgentId
);

uuid_id!(
    /// Unique identifier for a dispatched task.
    TaskId
);

/// Kind of work a policy schedules.
///
/// Each policy carries one schedule per type, tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Create a new snapshot.
    Backup,
    /// Verify repository integrity.
    Check,
    /// Apply retention and reclaim space.
    Prune,
}

impl TaskType {
    /// All task types in evaluation order.
    pub const ALL: [TaskType; 3] = [TaskType::Backup, TaskType::Check, TaskType::Prune];

    /// Stable lowercase name, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Backup => "backup",
            TaskType::Check => "check",
            TaskType::Prune => "prune",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(TaskType::Backup),
            "check" => Ok(TaskType::Check),
            "prune" => Ok(TaskType::Prune),
            other => Err(format!("unknown task type: {}", other)),
        }
    }
}
