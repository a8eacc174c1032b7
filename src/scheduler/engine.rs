//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Evaluating every enabled policy's backup, check and prune schedules
//! - Creating one task per assigned agent when a pair is due
//! - Advancing the per-pair cursor so each due window fires exactly once
//! - Recording metrics and serving the status view

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::MissedTickBehavior;

use super::handle::{COMMAND_CHANNEL_BUFFER, LoopHandle};
use super::metrics::{MetricsSnapshot, SchedulerMetrics};
use super::status::{SchedulerStatus, UpcomingScheduleItem};
use super::types::{PairOutcome, SchedulerCommand, SchedulerError, SchedulerState, TickSummary};
use crate::core::policy::Policy;
use crate::core::schedule::{Schedule, ScheduleKind};
use crate::core::task::Task;
use crate::core::types::TaskType;
use crate::storage::{PolicyTaskState, Storage};

/// Default period between scheduler ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// The part of the scheduler shared with the background loop.
struct Evaluator<S: Storage> {
    storage: Arc<S>,
    metrics: Arc<SchedulerMetrics>,
    /// Serializes ticks, so no two evaluations touch the same state row at once.
    tick_lock: Arc<Mutex<()>>,
}

impl<S: Storage> Clone for Evaluator<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            metrics: Arc::clone(&self.metrics),
            tick_lock: Arc::clone(&self.tick_lock),
        }
    }
}

impl<S: Storage> Evaluator<S> {
    async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary, SchedulerError> {
        let _guard = self.tick_lock.lock().await;
        let started = Instant::now();

        let policies = match self.storage.list_enabled_policies().await {
            Ok(policies) => policies,
            Err(e) => {
                self.metrics.record_error(&e);
                tracing::warn!(error = %e, "Failed to load enabled policies");
                return Err(e.into());
            }
        };

        let mut summary = TickSummary::default();
        for policy in policies.iter().filter(|p| p.enabled) {
            let mut processed = false;

            for (task_type, schedule) in policy.schedules() {
                match self
                    .process_schedule_type(policy, task_type, schedule, now)
                    .await
                {
                    Ok(outcome) => {
                        processed = true;
                        summary.absorb(outcome);
                    }
                    Err(e) => {
                        self.metrics.record_error(&e);
                        summary.errors += 1;
                        tracing::warn!(
                            policy_id = %policy.id,
                            policy = %policy.name,
                            task_type = %task_type,
                            error = %e,
                            "Skipping schedule for this tick"
                        );
                    }
                }
            }

            if processed {
                summary.policies_processed += 1;
            }
        }

        self.metrics
            .record_scheduler_run(started.elapsed(), summary.policies_processed);
        tracing::debug!(
            policies = summary.policies_processed,
            tasks = summary.tasks_created,
            errors = summary.errors,
            "Scheduler tick complete"
        );
        Ok(summary)
    }

    async fn process_schedule_type(
        &self,
        policy: &Policy,
        task_type: TaskType,
        schedule: &str,
        now: DateTime<Utc>,
    ) -> Result<PairOutcome, SchedulerError> {
        let parsed = Schedule::parse(schedule)?;

        let existing = self
            .storage
            .get_policy_task_state(&policy.id, task_type)
            .await?;

        let state = match existing {
            Some(state) if state.next_run.is_some() => state,
            _ => {
                // Intervals fire on the first tick; cron waits for its next slot.
                let next_run = match parsed.kind() {
                    ScheduleKind::Interval => now,
                    ScheduleKind::Cron => parsed.next_run(now)?,
                };
                let mut seed =
                    PolicyTaskState::new(policy.id, task_type).with_next_run(next_run);
                seed.updated_at = now;
                self.storage.seed_policy_task_state(seed).await?
            }
        };

        let Some(next_run) = state.next_run.filter(|_| state.is_due(now)) else {
            let next_run = state.next_run.unwrap_or(now);
            self.metrics.update_next_run(policy.id, task_type, next_run);
            tracing::debug!(
                policy_id = %policy.id,
                task_type = %task_type,
                next_run = %next_run,
                "Schedule not due"
            );
            return Ok(PairOutcome::NotDue { next_run });
        };

        let agents = self.storage.get_policy_agents(&policy.id).await?;
        let mut tasks_created = 0;
        let mut failed_agents = 0;

        for agent in &agents {
            let task = Task::from_policy(policy, agent.id, task_type, now);
            let task_id = task.id;

            match self.storage.create_task(task).await {
                Ok(()) => {
                    tasks_created += 1;
                    self.metrics.record_task_generated(task_type);
                    tracing::info!(
                        task_id = %task_id,
                        policy_id = %policy.id,
                        agent_id = %agent.id,
                        task_type = %task_type,
                        due_at = %next_run,
                        "Task generated"
                    );
                }
                Err(e) => {
                    failed_agents += 1;
                    self.metrics.record_error(&e);
                    tracing::warn!(
                        policy_id = %policy.id,
                        agent_id = %agent.id,
                        task_type = %task_type,
                        error = %e,
                        "Failed to create task"
                    );
                }
            }
        }

        let next_run = parsed.next_run_with_last(now, Some(now))?;
        let advanced = PolicyTaskState {
            policy_id: policy.id,
            task_type,
            last_run: Some(now),
            next_run: Some(next_run),
            updated_at: now,
        };
        self.storage.save_policy_task_state(advanced).await?;
        self.metrics.update_next_run(policy.id, task_type, next_run);

        Ok(PairOutcome::Dispatched {
            tasks_created,
            failed_agents,
            next_run,
        })
    }
}

/// The policy scheduler.
///
/// `start` spawns a background loop that ticks once immediately and then
/// every `tick_interval`. `stop` waits for the loop to exit, after which no
/// further tasks are generated.
pub struct Scheduler<S: Storage> {
    evaluator: Evaluator<S>,
    tick_interval: Duration,
    /// `Some` while the loop is running. Start and stop both hold this lock.
    control: Mutex<Option<LoopHandle>>,
    state: Arc<RwLock<SchedulerState>>,
}

impl<S: Storage + 'static> Scheduler<S> {
    /// Create a new scheduler with the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new scheduler with shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        Self {
            evaluator: Evaluator {
                storage,
                metrics: Arc::new(SchedulerMetrics::new()),
                tick_lock: Arc::new(Mutex::new(())),
            },
            tick_interval: DEFAULT_TICK_INTERVAL,
            control: Mutex::new(None),
            state: Arc::new(RwLock::new(SchedulerState::Stopped)),
        }
    }

    /// Set the tick interval. Zero is raised to one millisecond.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Get the storage backend.
    pub fn storage(&self) -> &Arc<S> {
        &self.evaluator.storage
    }

    /// Shared metrics, for readers that outlive a borrow of the scheduler.
    pub fn metrics_handle(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.evaluator.metrics)
    }

    /// Snapshot of the current metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.evaluator.metrics.snapshot()
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler loop is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }

    /// Start the background loop.
    ///
    /// Returns [`SchedulerError::AlreadyRunning`] if it is already running.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut control = self.control.lock().await;
        if control.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let evaluator = self.evaluator.clone();
        let tick_interval = self.tick_interval;
        let join = tokio::spawn(async move {
            run_loop(evaluator, tick_interval, command_rx).await;
        });

        *control = Some(LoopHandle { command_tx, join });
        *self.state.write().await = SchedulerState::Running;
        tracing::info!(tick_interval = ?self.tick_interval, "Scheduler started");
        Ok(())
    }

    /// Stop the background loop and wait for it to exit.
    ///
    /// Stopping a stopped scheduler is a no-op.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut control = self.control.lock().await;
        let Some(handle) = control.take() else {
            return Ok(());
        };

        let result = handle.shutdown().await;
        *self.state.write().await = SchedulerState::Stopped;
        tracing::info!("Scheduler stopped");
        result
    }

    /// Evaluate one tick now.
    ///
    /// While running, the tick is handed to the loop; otherwise it runs
    /// inline. Either way it is serialized with loop ticks.
    pub async fn run_now(&self) -> Result<TickSummary, SchedulerError> {
        let command_tx = {
            let control = self.control.lock().await;
            control.as_ref().map(|handle| handle.command_tx.clone())
        };

        match command_tx {
            Some(command_tx) => LoopHandle::run_now(&command_tx).await,
            None => self.evaluator.tick(Utc::now()).await,
        }
    }

    /// Evaluate one tick as of `now`, inline.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<TickSummary, SchedulerError> {
        self.evaluator.tick(now).await
    }

    /// Evaluate a single `(policy, task type)` pair as of `now`.
    ///
    /// Errors are returned rather than recorded in metrics.
    pub async fn process_schedule_type(
        &self,
        policy: &Policy,
        task_type: TaskType,
        schedule: &str,
        now: DateTime<Utc>,
    ) -> Result<PairOutcome, SchedulerError> {
        let _guard = self.evaluator.tick_lock.lock().await;
        self.evaluator
            .process_schedule_type(policy, task_type, schedule, now)
            .await
    }

    /// Build the operator status view.
    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let storage = &self.evaluator.storage;
        let policies = storage.list_enabled_policies().await?;
        let states = storage.list_policy_task_states().await?;

        let mut upcoming = Vec::new();
        for policy in &policies {
            for (task_type, schedule) in policy.schedules() {
                let next_run = states
                    .iter()
                    .find(|s| s.policy_id == policy.id && s.task_type == task_type)
                    .and_then(|s| s.next_run);

                if let Some(next_run) = next_run {
                    upcoming.push(UpcomingScheduleItem {
                        policy_id: policy.id,
                        policy_name: policy.name.clone(),
                        task_type,
                        next_run,
                        schedule: schedule.to_string(),
                    });
                }
            }
        }
        upcoming.sort_by(|a, b| a.next_run.cmp(&b.next_run));

        let metrics = self.metrics();
        Ok(SchedulerStatus {
            running: self.is_running().await,
            last_run: metrics.last_run_at,
            total_runs: metrics.total_runs,
            tasks_generated: metrics.tasks_generated,
            errors_total: metrics.errors_total,
            last_error: metrics.last_error.clone(),
            policies_enabled: policies.len(),
            upcoming_schedule: upcoming,
            metrics,
        })
    }
}

/// Main scheduler loop.
async fn run_loop<S: Storage>(
    evaluator: Evaluator<S>,
    tick_interval: Duration,
    mut command_rx: mpsc::Receiver<SchedulerCommand>,
) {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = evaluator.tick(Utc::now()).await {
                    tracing::warn!(error = %e, "Scheduler tick failed");
                }
            }

            command = command_rx.recv() => {
                match command {
                    Some(SchedulerCommand::RunNow { response }) => {
                        let result = evaluator.tick(Utc::now()).await;
                        let _ = response.send(result);
                    }
                    Some(SchedulerCommand::Shutdown { response }) => {
                        let _ = response.send(());
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
