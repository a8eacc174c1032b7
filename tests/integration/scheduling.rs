//! Schedule evaluation integration tests.
//!
//! Tests that verify due policies produce exactly one task per assigned
//! agent, and that missed windows are coalesced after downtime.

use crate::common::{at, register};
use bosun::{
    InMemoryStorage, PairOutcome, Policy, PolicyTaskState, Scheduler, Storage, TaskFilter,
    TaskStatus, TaskType,
};
use chrono::{TimeDelta, TimeZone, Utc};
use std::sync::Arc;

/// Test: An `every 1m` policy fires once, then not again within the minute.
#[tokio::test]
async fn test_interval_policy_end_to_end() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("files", "every 1m").with_repository("/srv/restic");
    let agents = register(storage.as_ref(), &policy, &["db-01"]).await;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    let first = scheduler.run_once_at(at(10, 0)).await.unwrap();
    assert_eq!(first.tasks_created, 1);

    let tasks = storage.list_tasks(&TaskFilter::all()).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::Backup);
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert_eq!(tasks[0].agent_id, agents[0].id);
    assert_eq!(tasks[0].repository, "/srv/restic");

    let second = scheduler
        .run_once_at(at(10, 0) + TimeDelta::seconds(45))
        .await
        .unwrap();
    assert_eq!(second.tasks_created, 0);
    assert_eq!(storage.list_tasks(&TaskFilter::all()).await.unwrap().len(), 1);
}

/// Test: A nightly cron policy evaluated mid-morning waits for the next night.
#[tokio::test]
async fn test_cron_policy_waits_for_next_occurrence() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("nightly", "0 2 * * *");
    register(storage.as_ref(), &policy, &["db-01"]).await;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    let summary = scheduler.run_once_at(at(10, 30)).await.unwrap();
    assert_eq!(summary.tasks_created, 0);

    let state = storage
        .get_policy_task_state(&policy.id, TaskType::Backup)
        .await
        .unwrap()
        .unwrap();
    let next_night = Utc.with_ymd_and_hms(2024, 1, 16, 2, 0, 0).unwrap();
    assert_eq!(state.next_run, Some(next_night));

    // Fires at 02:00 sharp and moves on to the following night.
    let summary = scheduler.run_once_at(next_night).await.unwrap();
    assert_eq!(summary.tasks_created, 1);
    let state = storage
        .get_policy_task_state(&policy.id, TaskType::Backup)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.last_run, Some(next_night));
    assert_eq!(
        state.next_run,
        Some(Utc.with_ymd_and_hms(2024, 1, 17, 2, 0, 0).unwrap())
    );
}

/// Test: Evaluated before 02:00, the same day's slot is used.
#[tokio::test]
async fn test_cron_policy_same_day_slot() {
    let scheduler = Scheduler::new(InMemoryStorage::new());
    let policy = Policy::new("nightly", "0 2 * * *");
    register(scheduler.storage().as_ref(), &policy, &["db-01"]).await;

    let outcome = scheduler
        .process_schedule_type(&policy, TaskType::Backup, &policy.schedule, at(1, 15))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        PairOutcome::NotDue {
            next_run: at(2, 0)
        }
    );
}

/// Test: Backup, check and prune schedules are tracked independently.
#[tokio::test]
async fn test_three_schedules_from_clean_state() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("full", "every 1h")
        .with_check_schedule("every 2h")
        .with_prune_schedule("0 3 * * 0");
    register(storage.as_ref(), &policy, &["db-01"]).await;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    scheduler.run_once_at(at(10, 30)).await.unwrap();

    let tasks = storage.list_tasks(&TaskFilter::all()).await.unwrap();
    assert_eq!(tasks.len(), 2);
    let prune = storage
        .list_tasks(&TaskFilter::all().task_type(TaskType::Prune))
        .await
        .unwrap();
    assert!(prune.is_empty());
    assert_eq!(
        storage
            .list_tasks(&TaskFilter::all().task_type(TaskType::Check))
            .await
            .unwrap()
            .len(),
        1
    );

    let states = storage.list_policy_task_states().await.unwrap();
    assert_eq!(states.len(), 3);
    let prune_state = states
        .iter()
        .find(|s| s.task_type == TaskType::Prune)
        .unwrap();
    // Sunday 2024-01-21 03:00.
    assert_eq!(
        prune_state.next_run,
        Some(Utc.with_ymd_and_hms(2024, 1, 21, 3, 0, 0).unwrap())
    );
    assert_eq!(prune_state.last_run, None);
}

/// Test: Two hours of missed 15-minute windows produce one task.
#[tokio::test]
async fn test_interval_catch_up_is_coalesced() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("frequent", "every 15m");
    register(storage.as_ref(), &policy, &["db-01"]).await;
    let now = at(12, 0);
    storage
        .save_policy_task_state(
            PolicyTaskState::new(policy.id, TaskType::Backup)
                .with_last_run(now - TimeDelta::hours(2))
                .with_next_run(now - TimeDelta::hours(2) + TimeDelta::minutes(15)),
        )
        .await
        .unwrap();
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    let summary = scheduler.run_once_at(now).await.unwrap();

    assert_eq!(summary.tasks_created, 1);
    let state = storage
        .get_policy_task_state(&policy.id, TaskType::Backup)
        .await
        .unwrap()
        .unwrap();
    assert!(state.next_run.unwrap() > now);
}

/// Test: A day of missed cron slots produces one task.
#[tokio::test]
async fn test_cron_catch_up_is_coalesced() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("quarterly-hour", "*/15 * * * *");
    register(storage.as_ref(), &policy, &["db-01", "db-02"]).await;
    let now = at(12, 7);
    storage
        .save_policy_task_state(
            PolicyTaskState::new(policy.id, TaskType::Backup).with_next_run(now - TimeDelta::days(1)),
        )
        .await
        .unwrap();
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    let summary = scheduler.run_once_at(now).await.unwrap();

    // One task per agent, not one per missed slot.
    assert_eq!(summary.tasks_created, 2);
    let state = storage
        .get_policy_task_state(&policy.id, TaskType::Backup)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.next_run, Some(at(12, 15)));

    let summary = scheduler.run_once_at(at(12, 10)).await.unwrap();
    assert_eq!(summary.tasks_created, 0);
}

/// Test: A disabled policy never fires, even with a due state row.
#[tokio::test]
async fn test_disabled_policy_never_fires() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("paused", "every 1m").with_enabled(false);
    register(storage.as_ref(), &policy, &["db-01"]).await;
    storage
        .save_policy_task_state(
            PolicyTaskState::new(policy.id, TaskType::Backup).with_next_run(at(0, 0)),
        )
        .await
        .unwrap();
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    for minute in 0..30 {
        scheduler.run_once_at(at(9, minute)).await.unwrap();
    }
    assert!(storage.list_tasks(&TaskFilter::all()).await.unwrap().is_empty());

    // Re-enabling picks up the stale row as a single catch-up task.
    storage
        .upsert_policy(policy.clone().with_enabled(true))
        .await
        .unwrap();
    let summary = scheduler.run_once_at(at(9, 30)).await.unwrap();
    assert_eq!(summary.tasks_created, 1);
}

/// Test: The due check includes the exact `next_run` instant.
#[tokio::test]
async fn test_due_boundary_is_inclusive() {
    let storage = Arc::new(InMemoryStorage::new());
    let cron = Policy::new("top-of-hour", "0 * * * *");
    let interval = Policy::new("half-hourly", "every 30m");
    register(storage.as_ref(), &cron, &["db-01"]).await;
    register(storage.as_ref(), &interval, &["db-02"]).await;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    // Seeds: cron -> 11:00, interval fires now and moves to 11:00.
    let summary = scheduler.run_once_at(at(10, 30)).await.unwrap();
    assert_eq!(summary.tasks_created, 1);

    let summary = scheduler
        .run_once_at(at(11, 0) - TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(summary.tasks_created, 0);

    let summary = scheduler.run_once_at(at(11, 0)).await.unwrap();
    assert_eq!(summary.tasks_created, 2);
}

/// Test: A due policy with no agents still advances its state.
#[tokio::test]
async fn test_policy_without_agents_advances() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("orphan", "every 1h");
    register(storage.as_ref(), &policy, &[]).await;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    let summary = scheduler.run_once_at(at(8, 0)).await.unwrap();

    assert_eq!(summary.tasks_created, 0);
    assert_eq!(summary.pairs_dispatched, 1);
    let state = storage
        .get_policy_task_state(&policy.id, TaskType::Backup)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.next_run, Some(at(9, 0)));
}

/// Test: Tasks are frozen copies; later policy edits do not change them.
#[tokio::test]
async fn test_tasks_snapshot_policy_target() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("files", "every 1h")
        .with_repository("/srv/old")
        .with_include_paths(["/home"]);
    register(storage.as_ref(), &policy, &["db-01"]).await;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    scheduler.run_once_at(at(8, 0)).await.unwrap();
    storage
        .upsert_policy(policy.clone().with_repository("/srv/new"))
        .await
        .unwrap();
    scheduler.run_once_at(at(9, 0)).await.unwrap();

    let tasks = storage.list_tasks(&TaskFilter::all()).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].repository, "/srv/old");
    assert_eq!(tasks[1].repository, "/srv/new");
    assert_eq!(tasks[1].include_paths, vec!["/home"]);
}

/// Test: Metrics snapshots are unaffected by later ticks.
#[tokio::test]
async fn test_metrics_snapshot_isolation() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("files", "every 1h").with_check_schedule("every 1h");
    register(storage.as_ref(), &policy, &["db-01"]).await;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    scheduler.run_once_at(at(8, 0)).await.unwrap();
    let before = scheduler.metrics();

    scheduler.run_once_at(at(9, 0)).await.unwrap();
    scheduler
        .storage()
        .upsert_policy(Policy::new("other", "every 1m"))
        .await
        .unwrap();
    scheduler.run_once_at(at(9, 30)).await.unwrap();

    assert_eq!(before.total_runs, 1);
    assert_eq!(before.tasks_generated, 2);
    assert_eq!(before.next_runs.len(), 1);
    assert_eq!(before.next_runs[&policy.id][&TaskType::Backup], at(9, 0));

    let after = scheduler.metrics();
    assert_eq!(after.total_runs, 3);
    assert_eq!(after.tasks_generated, 4);
    assert_eq!(after.next_runs.len(), 2);
    assert_eq!(after.next_runs[&policy.id][&TaskType::Backup], at(10, 0));
}
