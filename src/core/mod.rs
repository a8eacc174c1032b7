//! Domain types: identifiers, schedules, policies, tasks and retry rules.

pub mod policy;
pub mod retry;
pub mod schedule;
pub mod task;
pub mod types;
