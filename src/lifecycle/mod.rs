//! Agent-facing task lifecycle.
//!
//! Agents claim pending tasks, acknowledge them, and submit results. Failed
//! results with retry budget left send the task back to pending behind a
//! backoff window; the per-agent aggregate of those windows is kept on the
//! agent record for admission decisions.

mod backoff;
mod manager;

pub use backoff::{AgentBackoff, BackoffTask};
pub use manager::{AckResponse, TaskLifecycle};

use thiserror::Error;

use crate::core::task::InvalidTransition;
use crate::storage::StorageError;

/// Errors returned by [`TaskLifecycle`] operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// No such task for the calling agent.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The task's status does not allow the requested operation.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// The submitted result is malformed.
    #[error("invalid result: {0}")]
    InvalidResult(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
