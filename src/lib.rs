//! bosun - policy scheduler and task lifecycle engine for backup agents.
//!
//! Policies carry up to three schedules (backup, check, prune). The
//! [`Scheduler`] turns each due schedule into one task per assigned agent,
//! coalescing any missed windows into a single task. Agents then move tasks
//! through [`TaskLifecycle`]: claim, acknowledge, and submit a result, with
//! failed tasks retried behind an increasing backoff.

pub mod config;
pub mod core;
pub mod lifecycle;
pub mod scheduler;
pub mod storage;

pub use config::{ConfigError, Fleet, FleetBuilder, GlobalConfig, StorageConfig, YamlLoader};
pub use core::policy::{Agent, Policy, RetentionRules};
pub use core::retry::{
    BackoffPolicy, ErrorCategory, categorize_error, is_permanent_error, should_retry,
};
pub use core::schedule::{Schedule, ScheduleError, ScheduleKind};
pub use core::task::{
    InvalidTransition, ResultOutcome, ResultStatus, Task, TaskResult, TaskStatus,
};
pub use core::types::{AgentId, PolicyId, TaskId, TaskType};
pub use lifecycle::{AckResponse, AgentBackoff, BackoffTask, LifecycleError, TaskLifecycle};
pub use scheduler::{
    MetricsSnapshot, PairOutcome, Scheduler, SchedulerError, SchedulerMetrics, SchedulerState,
    SchedulerStatus, TickSummary, UpcomingScheduleItem,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{
    AckOutcome, InMemoryStorage, PolicyTaskState, Storage, StorageError, TaskFilter,
};
