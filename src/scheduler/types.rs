//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use crate::core::schedule::ScheduleError;
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `start` was called while the loop is running.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// A policy schedule failed to parse or produced no next run.
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
}

/// What evaluating one `(policy, task type)` pair did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    /// Not due yet.
    NotDue { next_run: DateTime<Utc> },
    /// Due: tasks were generated and the cursor advanced.
    Dispatched {
        tasks_created: usize,
        failed_agents: usize,
        next_run: DateTime<Utc>,
    },
}

/// Totals for one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Enabled policies with at least one pair evaluated without error.
    pub policies_processed: usize,
    /// Pairs that were due and dispatched.
    pub pairs_dispatched: usize,
    pub tasks_created: usize,
    /// Pair failures plus per-agent task creation failures.
    pub errors: usize,
}

impl TickSummary {
    pub(crate) fn absorb(&mut self, outcome: PairOutcome) {
        if let PairOutcome::Dispatched {
            tasks_created,
            failed_agents,
            ..
        } = outcome
        {
            self.pairs_dispatched += 1;
            self.tasks_created += tasks_created;
            self.errors += failed_agents;
        }
    }
}

/// Commands that can be sent to the scheduler loop.
pub(crate) enum SchedulerCommand {
    /// Evaluate one tick immediately.
    RunNow {
        response: oneshot::Sender<Result<TickSummary, SchedulerError>>,
    },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
