//! Scheduler counters and point-in-time snapshots.
//!
//! All mutation goes through one `RwLock`. Snapshots copy every map, so a
//! snapshot never changes after it has been returned.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::core::types::{PolicyId, TaskType};

#[derive(Debug, Default)]
struct MetricsInner {
    scheduler_runs: u64,
    last_run_at: Option<DateTime<Utc>>,
    last_run_duration: Duration,
    total_run_duration: Duration,
    policies_processed: usize,
    tasks_generated: u64,
    tasks_generated_by_type: HashMap<TaskType, u64>,
    errors_total: u64,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    next_runs: HashMap<PolicyId, HashMap<TaskType, DateTime<Utc>>>,
}

/// Process-wide scheduler counters, shared between the loop and readers.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    inner: RwLock<MetricsInner>,
}

/// Immutable copy of [`SchedulerMetrics`] at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_duration_ms: u64,
    /// Cumulative mean: total processing time divided by runs.
    pub average_run_duration_ms: u64,
    /// Policies with at least one schedule evaluated in the last run.
    pub policies_processed: usize,
    pub tasks_generated: u64,
    pub tasks_generated_by_type: BTreeMap<TaskType, u64>,
    pub errors_total: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub next_runs: BTreeMap<PolicyId, BTreeMap<TaskType, DateTime<Utc>>>,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock leaves plain counters behind, so a
    // poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, MetricsInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MetricsInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one completed loop iteration.
    pub fn record_scheduler_run(&self, duration: Duration, policies_processed: usize) {
        let mut inner = self.write();
        inner.scheduler_runs += 1;
        inner.last_run_at = Some(Utc::now());
        inner.last_run_duration = duration;
        inner.total_run_duration += duration;
        inner.policies_processed = policies_processed;
    }

    /// Record one task created for a task type.
    pub fn record_task_generated(&self, task_type: TaskType) {
        let mut inner = self.write();
        inner.tasks_generated += 1;
        *inner.tasks_generated_by_type.entry(task_type).or_insert(0) += 1;
    }

    /// Record a recovered error and keep its message as the last error.
    pub fn record_error(&self, error: &dyn Display) {
        let mut inner = self.write();
        inner.errors_total += 1;
        inner.last_error = Some(error.to_string());
        inner.last_error_at = Some(Utc::now());
    }

    /// Remember when a policy's task type runs next.
    pub fn update_next_run(&self, policy_id: PolicyId, task_type: TaskType, next_run: DateTime<Utc>) {
        let mut inner = self.write();
        inner
            .next_runs
            .entry(policy_id)
            .or_default()
            .insert(task_type, next_run);
    }

    /// Seconds from `now` until the recorded next run, floored at zero.
    pub fn next_run_seconds(
        &self,
        policy_id: &PolicyId,
        task_type: TaskType,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        let inner = self.read();
        inner
            .next_runs
            .get(policy_id)
            .and_then(|by_type| by_type.get(&task_type))
            .map(|next_run| (*next_run - now).num_seconds().max(0))
    }

    /// Deep copy of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.read();
        let average = if inner.scheduler_runs == 0 {
            Duration::ZERO
        } else {
            inner
                .total_run_duration
                .div_f64(inner.scheduler_runs as f64)
        };

        MetricsSnapshot {
            total_runs: inner.scheduler_runs,
            last_run_at: inner.last_run_at,
            last_run_duration_ms: millis(inner.last_run_duration),
            average_run_duration_ms: millis(average),
            policies_processed: inner.policies_processed,
            tasks_generated: inner.tasks_generated,
            tasks_generated_by_type: inner
                .tasks_generated_by_type
                .iter()
                .map(|(t, n)| (*t, *n))
                .collect(),
            errors_total: inner.errors_total,
            last_error: inner.last_error.clone(),
            last_error_at: inner.last_error_at,
            next_runs: inner
                .next_runs
                .iter()
                .map(|(policy_id, by_type)| {
                    let by_type = by_type.iter().map(|(t, at)| (*t, *at)).collect();
                    (*policy_id, by_type)
                })
                .collect(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
