//! SQLite persistence integration tests.
//!
//! Tests that verify schedule state and tasks survive a restart, so a
//! scheduler coming back after downtime catches up with one task.

use crate::common::{at, register};
use bosun::{
    FleetBuilder, Policy, PolicyId, ResultOutcome, Scheduler, SqliteStorage, Storage, TaskFilter,
    TaskLifecycle, TaskResult, TaskStatus, TaskType, YamlLoader,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Test: The schedule cursor survives a restart.
#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bosun.db");
    let policy = Policy::new("files", "every 15m");

    {
        let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
        register(storage.as_ref(), &policy, &["db-01"]).await;
        let scheduler = Scheduler::with_storage(Arc::clone(&storage));

        let summary = scheduler.run_once_at(at(8, 0)).await.unwrap();
        assert_eq!(summary.tasks_created, 1);
        storage.close().await;
    }

    let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
    // Re-registering the same fleet is harmless.
    register(storage.as_ref(), &policy, &["db-01"]).await;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));

    let summary = scheduler.run_once_at(at(8, 10)).await.unwrap();
    assert_eq!(summary.tasks_created, 0);

    // Down for three hours: one catch-up task, re-anchored to now.
    let summary = scheduler.run_once_at(at(11, 10)).await.unwrap();
    assert_eq!(summary.tasks_created, 1);

    let state = storage
        .get_policy_task_state(&policy.id, TaskType::Backup)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.last_run, Some(at(11, 10)));
    assert_eq!(state.next_run, Some(at(11, 25)));
    assert_eq!(storage.list_tasks(&TaskFilter::all()).await.unwrap().len(), 2);
    storage.close().await;
}

/// Test: The full lifecycle runs against SQLite.
#[tokio::test]
async fn test_lifecycle_on_sqlite() {
    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let policy = Policy::new("files", "every 1h").with_max_retries(1);
    let agents = register(storage.as_ref(), &policy, &["db-01"]).await;
    let agent = &agents[0];
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    let lifecycle = TaskLifecycle::new(Arc::clone(&storage));

    scheduler.run_once_at(at(2, 0)).await.unwrap();
    let task_id = lifecycle.claim_tasks_at(&agent.id, 1, at(2, 0)).await.unwrap()[0].id;
    lifecycle.acknowledge_at(&agent.id, &task_id, at(2, 0)).await.unwrap();

    let outcome = lifecycle
        .submit_result_at(&agent.id, &task_id, TaskResult::failure(1.0, "connection refused"), at(2, 1))
        .await
        .unwrap();
    let ResultOutcome::RetryScheduled { next_retry_at, .. } = outcome else {
        panic!("expected a retry, got {:?}", outcome);
    };

    let stored = storage.get_agent(&agent.id).await.unwrap();
    assert_eq!(stored.tasks_in_backoff, 1);
    assert_eq!(stored.earliest_retry_at, Some(next_retry_at));

    let task_id = lifecycle.claim_tasks_at(&agent.id, 1, next_retry_at).await.unwrap()[0].id;
    lifecycle.acknowledge_at(&agent.id, &task_id, next_retry_at).await.unwrap();
    let outcome = lifecycle
        .submit_result_at(&agent.id, &task_id, TaskResult::failure(1.0, "connection refused"), next_retry_at)
        .await
        .unwrap();
    assert!(matches!(outcome, ResultOutcome::Failed { .. }));

    let task = storage.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(storage.get_agent(&agent.id).await.unwrap().tasks_in_backoff, 0);
}

/// Test: Concurrent claims against one database file never share a task.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::new(dir.path().join("claims.db")).await.unwrap());
    let policy = Policy::new("files", "every 1h");
    let agents = register(storage.as_ref(), &policy, &["db-01"]).await;
    let agent_id = agents[0].id;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    for hour in 0..6 {
        scheduler.run_once_at(at(hour, 0)).await.unwrap();
    }

    let lifecycle = Arc::new(TaskLifecycle::new(Arc::clone(&storage)));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.claim_tasks_at(&agent_id, 2, at(12, 0)).await })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for task in handle.await.unwrap().unwrap() {
            assert!(seen.insert(task.id), "task {} claimed twice", task.id);
        }
    }
    assert_eq!(seen.len(), 6);
    storage.close().await;
}

/// Test: A persistent store drops policies and assignments removed from the config.
#[tokio::test]
async fn test_reseed_after_config_edit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bosun.db");
    let seed = |yaml: &'static str| {
        let path = path.clone();
        async move {
            let storage = SqliteStorage::new(&path).await.unwrap();
            let config = YamlLoader::parse_global_config(yaml).unwrap();
            FleetBuilder::build(&config)
                .unwrap()
                .seed(&storage)
                .await
                .unwrap();
            storage.close().await;
        }
    };

    seed(
        r#"
agents:
  - hostname: db-01
  - hostname: db-02
policies:
  - name: keep
    schedule: every 1h
    agents: [db-01, db-02]
  - name: removed
    schedule: every 1h
    agents: [db-01]
"#,
    )
    .await;
    seed(
        r#"
agents:
  - hostname: db-01
  - hostname: db-02
policies:
  - name: keep
    schedule: every 1h
    agents: [db-01]
"#,
    )
    .await;

    let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    let summary = scheduler.run_once_at(at(9, 0)).await.unwrap();
    assert_eq!(summary.tasks_created, 1);

    let removed = storage
        .get_policy(&PolicyId::from_name("removed"))
        .await
        .unwrap();
    assert!(!removed.enabled);
    storage.close().await;
}
