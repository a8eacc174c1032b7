//! Policy scheduler.
//!
//! This module provides the loop that turns policy schedules into tasks
//! for assigned agents, along with its metrics and status view.

mod engine;
mod handle;
mod metrics;
mod status;
mod types;

pub use engine::{DEFAULT_TICK_INTERVAL, Scheduler};
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use status::{SchedulerStatus, UpcomingScheduleItem};
pub use types::{PairOutcome, SchedulerError, SchedulerState, TickSummary};
