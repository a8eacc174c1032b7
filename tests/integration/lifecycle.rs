//! Task lifecycle integration tests.
//!
//! Tests that verify agents can claim, acknowledge and complete the tasks
//! the scheduler generates, and that failures are retried with backoff.

use crate::common::{at, register};
use bosun::{
    BackoffPolicy, ErrorCategory, InMemoryStorage, LifecycleError, Policy, ResultOutcome,
    Scheduler, Storage, TaskFilter, TaskLifecycle, TaskResult, TaskStatus,
};
use chrono::TimeDelta;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Test: A generated task goes all the way to completed.
#[tokio::test]
async fn test_generated_task_completes() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("files", "every 1h");
    let agents = register(storage.as_ref(), &policy, &["db-01"]).await;
    let agent = &agents[0];
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    let lifecycle = TaskLifecycle::new(Arc::clone(&storage));

    scheduler.run_once_at(at(6, 0)).await.unwrap();

    let claimed = lifecycle.claim_tasks_at(&agent.id, 5, at(6, 1)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, TaskStatus::Assigned);
    assert_eq!(claimed[0].assigned_at, Some(at(6, 1)));

    // Nothing left to claim.
    assert!(lifecycle.claim_tasks_at(&agent.id, 5, at(6, 1)).await.unwrap().is_empty());

    let task_id = claimed[0].id;
    let ack = lifecycle.acknowledge_at(&agent.id, &task_id, at(6, 2)).await.unwrap();
    assert_eq!(ack.status, "acknowledged");

    let outcome = lifecycle
        .submit_result_at(
            &agent.id,
            &task_id,
            TaskResult::success(42.0).with_snapshot_id("snap-1"),
            at(6, 3),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ResultOutcome::Completed);

    let task = storage.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_at, Some(at(6, 3)));
    assert_eq!(task.snapshot_id.as_deref(), Some("snap-1"));
}

/// Test: Claims return the oldest tasks first, up to the limit.
#[tokio::test]
async fn test_claim_order_and_limit() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("files", "every 1h");
    let agents = register(storage.as_ref(), &policy, &["db-01"]).await;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    let lifecycle = TaskLifecycle::new(Arc::clone(&storage));

    for hour in [1, 2, 3] {
        scheduler.run_once_at(at(hour, 0)).await.unwrap();
    }

    let first = lifecycle.claim_tasks_at(&agents[0].id, 2, at(4, 0)).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].scheduled_for, at(1, 0));
    assert_eq!(first[1].scheduled_for, at(2, 0));

    let rest = lifecycle.claim_tasks_at(&agents[0].id, 2, at(4, 0)).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].scheduled_for, at(3, 0));
}

/// Test: Concurrent claims for one agent never hand out a task twice.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("files", "every 1h");
    let agents = register(storage.as_ref(), &policy, &["db-01"]).await;
    let agent_id = agents[0].id;
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    for hour in 0..10 {
        scheduler.run_once_at(at(hour, 0)).await.unwrap();
    }

    let lifecycle = Arc::new(TaskLifecycle::new(Arc::clone(&storage)));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.claim_tasks_at(&agent_id, 3, at(12, 0)).await })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for task in handle.await.unwrap().unwrap() {
            assert!(seen.insert(task.id), "task {} claimed twice", task.id);
        }
    }
    assert_eq!(seen.len(), 10);

    let assigned = storage
        .list_tasks(&TaskFilter::all().status(TaskStatus::Assigned))
        .await
        .unwrap();
    assert_eq!(assigned.len(), 10);
}

/// Test: Acknowledge is idempotent and scoped to the owning agent.
#[tokio::test]
async fn test_acknowledge_semantics() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("files", "every 1h");
    let agents = register(storage.as_ref(), &policy, &["db-01", "db-02"]).await;
    let (owner, other) = (&agents[0], &agents[1]);
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    let lifecycle = TaskLifecycle::new(Arc::clone(&storage));

    scheduler.run_once_at(at(7, 0)).await.unwrap();
    let task_id = lifecycle.claim_tasks_at(&owner.id, 1, at(7, 0)).await.unwrap()[0].id;

    let err = lifecycle
        .acknowledge_at(&other.id, &task_id, at(7, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound(_)));

    lifecycle.acknowledge_at(&owner.id, &task_id, at(7, 1)).await.unwrap();
    lifecycle.acknowledge_at(&owner.id, &task_id, at(7, 5)).await.unwrap();

    let task = storage.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.acknowledged_at, Some(at(7, 1)));
    assert_eq!(task.started_at, Some(at(7, 1)));
}

/// Test: Retry delays grow, and exhaustion leaves the task failed for good.
#[tokio::test]
async fn test_retry_backoff_until_exhausted() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("flaky", "every 1h").with_max_retries(4);
    let agents = register(storage.as_ref(), &policy, &["db-01"]).await;
    let agent = &agents[0];
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    let lifecycle = TaskLifecycle::new(Arc::clone(&storage)).with_backoff(BackoffPolicy::new(
        Duration::from_secs(30),
        Duration::from_secs(120),
        2.0,
    ));

    scheduler.run_once_at(at(0, 0)).await.unwrap();
    let task_id = lifecycle.claim_tasks_at(&agent.id, 1, at(0, 0)).await.unwrap()[0].id;
    lifecycle.acknowledge_at(&agent.id, &task_id, at(0, 0)).await.unwrap();

    let mut now = at(0, 0);
    let mut delays = Vec::new();
    loop {
        let outcome = lifecycle
            .submit_result_at(&agent.id, &task_id, TaskResult::failure(1.0, "i/o timeout"), now)
            .await
            .unwrap();

        match outcome {
            ResultOutcome::RetryScheduled {
                retry_count,
                next_retry_at,
            } => {
                assert_eq!(retry_count as usize, delays.len() + 1);
                delays.push(next_retry_at - now);

                let backoff = lifecycle.agent_backoff_at(&agent.id, now).await.unwrap();
                assert_eq!(backoff.tasks_in_backoff, 1);
                assert_eq!(backoff.earliest_retry_at, Some(next_retry_at));

                // Claimable again exactly when the window ends.
                let early = next_retry_at - TimeDelta::seconds(1);
                assert!(lifecycle.claim_tasks_at(&agent.id, 1, early).await.unwrap().is_empty());
                now = next_retry_at;
                let claimed = lifecycle.claim_tasks_at(&agent.id, 1, now).await.unwrap();
                assert_eq!(claimed[0].id, task_id);
                lifecycle.acknowledge_at(&agent.id, &task_id, now).await.unwrap();
            }
            ResultOutcome::Failed { category } => {
                assert_eq!(category, ErrorCategory::Network);
                break;
            }
            ResultOutcome::Completed => panic!("failure reported as completed"),
        }
    }

    assert_eq!(delays.len(), 4);
    assert!(delays.windows(2).all(|pair| pair[1] > pair[0]));

    let task = storage.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 4);
    assert_eq!(task.next_retry_at, None);
    assert_eq!(task.last_error_category, Some(ErrorCategory::Network));

    let stored = storage.get_agent(&agent.id).await.unwrap();
    assert_eq!(stored.tasks_in_backoff, 0);
    assert_eq!(stored.earliest_retry_at, None);
}

/// Test: Repository errors fail immediately without retries.
#[tokio::test]
async fn test_permanent_failure() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("files", "every 1h");
    let agents = register(storage.as_ref(), &policy, &["db-01"]).await;
    let agent = &agents[0];
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    let lifecycle = TaskLifecycle::new(Arc::clone(&storage));

    scheduler.run_once_at(at(5, 0)).await.unwrap();
    let task_id = lifecycle.claim_tasks_at(&agent.id, 1, at(5, 0)).await.unwrap()[0].id;
    lifecycle.acknowledge_at(&agent.id, &task_id, at(5, 0)).await.unwrap();

    let outcome = lifecycle
        .submit_result_at(
            &agent.id,
            &task_id,
            TaskResult::failure(0.2, "Fatal: invalid repository password"),
            at(5, 1),
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ResultOutcome::Failed {
            category: ErrorCategory::Repository
        }
    );
    let task = storage.get_task(&task_id).await.unwrap();
    assert_eq!(task.retry_count, 0);
    assert_eq!(
        task.error_message.as_deref(),
        Some("Fatal: invalid repository password")
    );
}

/// Test: The backoff view aggregates several tasks of one agent.
#[tokio::test]
async fn test_agent_backoff_aggregate() {
    let storage = Arc::new(InMemoryStorage::new());
    let policy = Policy::new("files", "every 1h").with_check_schedule("every 1h");
    let agents = register(storage.as_ref(), &policy, &["db-01"]).await;
    let agent = &agents[0];
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    let lifecycle = TaskLifecycle::new(Arc::clone(&storage));

    scheduler.run_once_at(at(3, 0)).await.unwrap();
    let claimed = lifecycle.claim_tasks_at(&agent.id, 10, at(3, 0)).await.unwrap();
    assert_eq!(claimed.len(), 2);

    let messages = ["connection refused", "repository is locked"];
    for (offset, (task, message)) in claimed.iter().zip(messages).enumerate() {
        let now = at(3, 0) + TimeDelta::seconds(offset as i64);
        lifecycle.acknowledge_at(&agent.id, &task.id, now).await.unwrap();
        lifecycle
            .submit_result_at(&agent.id, &task.id, TaskResult::failure(1.0, message), now)
            .await
            .unwrap();
    }

    let refreshed = lifecycle
        .refresh_agent_backoff_at(&agent.id, at(3, 0) + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(refreshed.tasks_in_backoff, 2);
    // Default backoff: first retry after 5 seconds.
    assert_eq!(
        refreshed.earliest_retry_at,
        Some(at(3, 0) + TimeDelta::seconds(5))
    );
    let categories: Vec<_> = refreshed.tasks.iter().map(|t| t.error_category).collect();
    assert_eq!(
        categories,
        vec![Some(ErrorCategory::Network), Some(ErrorCategory::Transient)]
    );

    let stored = storage.get_agent(&agent.id).await.unwrap();
    assert!(stored.is_backing_off());
    assert_eq!(stored.tasks_in_backoff, 2);
}
