//! Backup policies and the agents they are assigned to.
//!
//! Schedules are kept as strings here and parsed at evaluation time, so a
//! single malformed policy is skipped by the scheduler instead of failing load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{AgentId, PolicyId, TaskType};

/// Snapshot retention counts. Unset fields are left to the backup tool's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_daily: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_yearly: Option<u32>,
}

impl RetentionRules {
    /// True when no retention count is set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A named backup configuration with up to three independent schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    pub enabled: bool,
    /// Backup schedule, always present.
    pub schedule: String,
    pub check_schedule: Option<String>,
    pub prune_schedule: Option<String>,
    pub repository: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub retention: RetentionRules,
    /// Retry budget inherited by every task generated from this policy.
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Default retry budget for new policies.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Create an enabled policy with a backup schedule and a name-derived id.
    pub fn new(name: impl Into<String>, schedule: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: PolicyId::from_name(&name),
            name,
            enabled: true,
            schedule: schedule.into(),
            check_schedule: None,
            prune_schedule: None,
            repository: String::new(),
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            retention: RetentionRules::default(),
            max_retries: Self::DEFAULT_MAX_RETRIES,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: PolicyId) -> Self {
        self.id = id;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_check_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.check_schedule = Some(schedule.into());
        self
    }

    pub fn with_prune_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.prune_schedule = Some(schedule.into());
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_include_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retention(mut self, retention: RetentionRules) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The `(task type, schedule)` pairs this policy evaluates each tick.
    ///
    /// Backup is always present; check and prune only when set and non-blank.
    pub fn schedules(&self) -> Vec<(TaskType, &str)> {
        let mut pairs = vec![(TaskType::Backup, self.schedule.as_str())];

        let optional = [
            (TaskType::Check, &self.check_schedule),
            (TaskType::Prune, &self.prune_schedule),
        ];
        for (task_type, schedule) in optional {
            if let Some(schedule) = schedule.as_deref().filter(|s| !s.trim().is_empty()) {
                pairs.push((task_type, schedule));
            }
        }

        pairs
    }

    /// The schedule string for one task type, if the policy has one.
    pub fn schedule_for(&self, task_type: TaskType) -> Option<&str> {
        self.schedules()
            .into_iter()
            .find(|(t, _)| *t == task_type)
            .map(|(_, s)| s)
    }
}

/// A registered backup agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub hostname: String,
    /// Capacity hint for the admission layer. `None` means no limit.
    pub max_concurrent_tasks: Option<u32>,
    /// Pending tasks of this agent still inside their backoff window.
    pub tasks_in_backoff: u32,
    /// Earliest `next_retry_at` among those tasks.
    pub earliest_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Create an agent with a hostname-derived id.
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            id: AgentId::from_name(&hostname),
            hostname,
            max_concurrent_tasks: None,
            tasks_in_backoff: 0,
            earliest_retry_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: AgentId) -> Self {
        self.id = id;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    /// True when at least one of the agent's tasks is waiting out a backoff.
    pub fn is_backing_off(&self) -> bool {
        self.tasks_in_backoff > 0
    }
}
