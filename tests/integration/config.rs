//! Configuration-driven fleet integration tests.
//!
//! Tests that verify a YAML fleet can be seeded into storage and driven by
//! the scheduler and task lifecycle with the configured backoff.

use crate::common::at;
use bosun::{
    AgentId, FleetBuilder, InMemoryStorage, PolicyId, ResultOutcome, Scheduler, Storage,
    TaskFilter, TaskLifecycle, TaskResult, TaskType, YamlLoader,
};
use chrono::TimeDelta;
use std::sync::Arc;
use std::time::Duration;

const FLEET: &str = r#"
scheduler:
  tick_interval_secs: 15
retry:
  base_delay_secs: 20
  max_delay_secs: 200
  multiplier: 2.0
agents:
  - hostname: db-01
  - hostname: db-02
policies:
  - name: databases
    schedule: every 6h
    check_schedule: every 1h
    repository: "s3:backups/db"
    include_paths: ["/var/lib/postgres"]
    retention: { keep_daily: 7, keep_weekly: 4 }
    agents: [db-01, db-02]
  - name: paused
    enabled: false
    schedule: every 1h
    agents: [db-01]
"#;

/// Test: A seeded fleet produces one task per assignment and schedule.
#[tokio::test]
async fn test_seeded_fleet_generates_tasks() {
    let config = YamlLoader::parse_global_config(FLEET).unwrap();
    let storage = Arc::new(InMemoryStorage::new());
    FleetBuilder::build(&config)
        .unwrap()
        .seed(storage.as_ref())
        .await
        .unwrap();

    let scheduler = Scheduler::with_storage(Arc::clone(&storage))
        .with_tick_interval(config.scheduler.tick_interval());
    let summary = scheduler.run_once_at(at(0, 0)).await.unwrap();

    // Two agents times backup and check.
    assert_eq!(summary.tasks_created, 4);
    assert_eq!(summary.policies_processed, 1);

    let policy_id = PolicyId::from_name("databases");
    let tasks = storage
        .list_tasks(&TaskFilter::all().policy(policy_id).task_type(TaskType::Backup))
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].repository, "s3:backups/db");
    assert_eq!(tasks[0].retention.keep_daily, Some(7));

    let status = scheduler.status().await.unwrap();
    assert_eq!(status.policies_enabled, 1);
    assert_eq!(status.upcoming_schedule[0].task_type, TaskType::Check);
    assert_eq!(status.upcoming_schedule[0].next_run, at(1, 0));
}

/// Test: The configured backoff drives retry timing.
#[tokio::test]
async fn test_configured_backoff() {
    let config = YamlLoader::parse_global_config(FLEET).unwrap();
    let fleet = FleetBuilder::build(&config).unwrap();
    let storage = Arc::new(InMemoryStorage::new());
    fleet.seed(storage.as_ref()).await.unwrap();

    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    let lifecycle =
        TaskLifecycle::new(Arc::clone(&storage)).with_backoff(config.retry.backoff_policy());
    assert_eq!(lifecycle.backoff().delay_for(1), Duration::from_secs(20));

    scheduler.run_once_at(at(0, 0)).await.unwrap();
    let agent = &fleet.agents[0];
    let task = lifecycle.claim_tasks_at(&agent.id, 1, at(0, 0)).await.unwrap().remove(0);
    lifecycle.acknowledge_at(&agent.id, &task.id, at(0, 0)).await.unwrap();

    let outcome = lifecycle
        .submit_result_at(&agent.id, &task.id, TaskResult::failure(2.0, "network unreachable"), at(0, 1))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ResultOutcome::RetryScheduled {
            retry_count: 1,
            next_retry_at: at(0, 1) + TimeDelta::seconds(20),
        }
    );
}

const BEFORE_EDIT: &str = r#"
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
"#;

const AFTER_EDIT: &str = r#"
agents:
  - hostname: db-01
  - hostname: db-02
policies:
  - name: keep
    schedule: every 1h
    agents: [db-01]
"#;

async fn seed_yaml<S: Storage + ?Sized>(storage: &S, yaml: &str) {
    let config = YamlLoader::parse_global_config(yaml).unwrap();
    FleetBuilder::build(&config)
        .unwrap()
        .seed(storage)
        .await
        .unwrap();
}

/// Test: Re-seeding an edited config stops tasks for removed policies and agents.
#[tokio::test]
async fn test_reseed_follows_config_edits() {
    let storage = Arc::new(InMemoryStorage::new());
    seed_yaml(storage.as_ref(), BEFORE_EDIT).await;
    seed_yaml(storage.as_ref(), AFTER_EDIT).await;

    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    let summary = scheduler.run_once_at(at(0, 0)).await.unwrap();

    assert_eq!(summary.tasks_created, 1);
    assert_eq!(storage.list_enabled_policies().await.unwrap().len(), 1);

    let tasks = storage.list_tasks(&TaskFilter::all()).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].policy_id, PolicyId::from_name("keep"));
    assert_eq!(tasks[0].agent_id, AgentId::from_name("db-01"));
}

/// Test: Re-seeding the original config restores what an edit removed.
#[tokio::test]
async fn test_reseed_restores_policy() {
    let storage = Arc::new(InMemoryStorage::new());
    seed_yaml(storage.as_ref(), BEFORE_EDIT).await;
    seed_yaml(storage.as_ref(), AFTER_EDIT).await;
    seed_yaml(storage.as_ref(), BEFORE_EDIT).await;

    assert_eq!(storage.list_enabled_policies().await.unwrap().len(), 2);
    let agents = storage
        .get_policy_agents(&PolicyId::from_name("keep"))
        .await
        .unwrap();
    assert_eq!(agents.len(), 2);
}
