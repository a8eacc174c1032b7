//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Timestamps are stored
//! as Unix milliseconds, path lists and retention rules as JSON text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{AckOutcome, PolicyTaskState, Storage, StorageError, TaskFilter};
use crate::core::policy::{Agent, Policy, RetentionRules};
use crate::core::retry::ErrorCategory;
use crate::core::task::{Task, TaskStatus};
use crate::core::types::{AgentId, PolicyId, TaskId, TaskType};

const TASK_COLUMNS: &str = "id, agent_id, policy_id, task_type, status, repository, \
    include_paths, exclude_paths, retention, scheduled_for, assigned_at, acknowledged_at, \
    started_at, completed_at, error_message, duration_seconds, snapshot_id, retry_count, \
    max_retries, next_retry_at, last_error_category, created_at, updated_at";

const POLICY_COLUMNS: &str = "id, name, enabled, schedule, check_schedule, prune_schedule, \
    repository, include_paths, exclude_paths, retention, max_retries, created_at, updated_at";

const AGENT_COLUMNS: &str =
    "id, hostname, max_concurrent_tasks, tasks_in_backoff, earliest_retry_at, created_at";

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(db_error)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(db_error)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_task_status(
        &self,
        task_id: &TaskId,
    ) -> Result<Option<TaskStatus>, StorageError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        status.map(|s| parse_column(&s, "status")).transpose()
    }
}

fn db_error(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::SerializationError(format!("invalid timestamp: {}", millis)))
}

fn opt_from_millis(millis: Option<i64>) -> Result<Option<DateTime<Utc>>, StorageError> {
    millis.map(from_millis).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, StorageError> {
    serde_json::from_str(text).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn parse_column<T>(value: &str, column: &str) -> Result<T, StorageError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StorageError::SerializationError(format!("{}: {}", column, e)))
}

fn to_u32(value: i64, column: &str) -> Result<u32, StorageError> {
    u32::try_from(value)
        .map_err(|_| StorageError::SerializationError(format!("{} out of range: {}", column, value)))
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(db_error)
}

fn policy_from_row(row: &SqliteRow) -> Result<Policy, StorageError> {
    Ok(Policy {
        id: parse_column(&get::<String>(row, "id")?, "id")?,
        name: get(row, "name")?,
        enabled: get(row, "enabled")?,
        schedule: get(row, "schedule")?,
        check_schedule: get(row, "check_schedule")?,
        prune_schedule: get(row, "prune_schedule")?,
        repository: get(row, "repository")?,
        include_paths: from_json(&get::<String>(row, "include_paths")?)?,
        exclude_paths: from_json(&get::<String>(row, "exclude_paths")?)?,
        retention: from_json::<RetentionRules>(&get::<String>(row, "retention")?)?,
        max_retries: to_u32(get(row, "max_retries")?, "max_retries")?,
        created_at: from_millis(get(row, "created_at")?)?,
        updated_at: from_millis(get(row, "updated_at")?)?,
    })
}

fn agent_from_row(row: &SqliteRow) -> Result<Agent, StorageError> {
    Ok(Agent {
        id: parse_column(&get::<String>(row, "id")?, "id")?,
        hostname: get(row, "hostname")?,
        max_concurrent_tasks: get::<Option<i64>>(row, "max_concurrent_tasks")?
            .map(|v| to_u32(v, "max_concurrent_tasks"))
            .transpose()?,
        tasks_in_backoff: to_u32(get(row, "tasks_in_backoff")?, "tasks_in_backoff")?,
        earliest_retry_at: opt_from_millis(get(row, "earliest_retry_at")?)?,
        created_at: from_millis(get(row, "created_at")?)?,
    })
}

fn state_from_row(row: &SqliteRow) -> Result<PolicyTaskState, StorageError> {
    Ok(PolicyTaskState {
        policy_id: parse_column(&get::<String>(row, "policy_id")?, "policy_id")?,
        task_type: parse_column(&get::<String>(row, "task_type")?, "task_type")?,
        last_run: opt_from_millis(get(row, "last_run")?)?,
        next_run: opt_from_millis(get(row, "next_run")?)?,
        updated_at: from_millis(get(row, "updated_at")?)?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StorageError> {
    Ok(Task {
        id: parse_column(&get::<String>(row, "id")?, "id")?,
        agent_id: parse_column(&get::<String>(row, "agent_id")?, "agent_id")?,
        policy_id: parse_column(&get::<String>(row, "policy_id")?, "policy_id")?,
        task_type: parse_column(&get::<String>(row, "task_type")?, "task_type")?,
        status: parse_column(&get::<String>(row, "status")?, "status")?,
        repository: get(row, "repository")?,
        include_paths: from_json(&get::<String>(row, "include_paths")?)?,
        exclude_paths: from_json(&get::<String>(row, "exclude_paths")?)?,
        retention: from_json(&get::<String>(row, "retention")?)?,
        scheduled_for: from_millis(get(row, "scheduled_for")?)?,
        assigned_at: opt_from_millis(get(row, "assigned_at")?)?,
        acknowledged_at: opt_from_millis(get(row, "acknowledged_at")?)?,
        started_at: opt_from_millis(get(row, "started_at")?)?,
        completed_at: opt_from_millis(get(row, "completed_at")?)?,
        error_message: get(row, "error_message")?,
        duration_seconds: get(row, "duration_seconds")?,
        snapshot_id: get(row, "snapshot_id")?,
        retry_count: to_u32(get(row, "retry_count")?, "retry_count")?,
        max_retries: to_u32(get(row, "max_retries")?, "max_retries")?,
        next_retry_at: opt_from_millis(get(row, "next_retry_at")?)?,
        last_error_category: get::<Option<String>>(row, "last_error_category")?
            .map(|c| parse_column::<ErrorCategory>(&c, "last_error_category"))
            .transpose()?,
        created_at: from_millis(get(row, "created_at")?)?,
        updated_at: from_millis(get(row, "updated_at")?)?,
    })
}

fn sort_by_schedule(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.scheduled_for
            .cmp(&b.scheduled_for)
            .then(a.created_at.cmp(&b.created_at))
    });
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn upsert_policy(&self, policy: Policy) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO policies (id, name, enabled, schedule, check_schedule, prune_schedule,
                repository, include_paths, exclude_paths, retention, max_retries,
                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                enabled = excluded.enabled,
                schedule = excluded.schedule,
                check_schedule = excluded.check_schedule,
                prune_schedule = excluded.prune_schedule,
                repository = excluded.repository,
                include_paths = excluded.include_paths,
                exclude_paths = excluded.exclude_paths,
                retention = excluded.retention,
                max_retries = excluded.max_retries,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(policy.id.to_string())
        .bind(&policy.name)
        .bind(policy.enabled)
        .bind(&policy.schedule)
        .bind(&policy.check_schedule)
        .bind(&policy.prune_schedule)
        .bind(&policy.repository)
        .bind(to_json(&policy.include_paths)?)
        .bind(to_json(&policy.exclude_paths)?)
        .bind(to_json(&policy.retention)?)
        .bind(i64::from(policy.max_retries))
        .bind(to_millis(policy.created_at))
        .bind(to_millis(policy.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_policy(&self, id: &PolicyId) -> Result<Policy, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM policies WHERE id = ?", POLICY_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StorageError::NotFound(format!("policy: {}", id)))?;
        policy_from_row(&row)
    }

    async fn list_policies(&self) -> Result<Vec<Policy>, StorageError> {
        let rows = sqlx::query(&format!("SELECT {} FROM policies ORDER BY name", POLICY_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(policy_from_row).collect()
    }

    async fn list_enabled_policies(&self) -> Result<Vec<Policy>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM policies WHERE enabled = 1 ORDER BY name",
            POLICY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter().map(policy_from_row).collect()
    }

    async fn upsert_agent(&self, agent: Agent) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, hostname, max_concurrent_tasks, tasks_in_backoff,
                earliest_retry_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                hostname = excluded.hostname,
                max_concurrent_tasks = excluded.max_concurrent_tasks
            "#,
        )
        .bind(agent.id.to_string())
        .bind(&agent.hostname)
        .bind(agent.max_concurrent_tasks.map(i64::from))
        .bind(i64::from(agent.tasks_in_backoff))
        .bind(agent.earliest_retry_at.map(to_millis))
        .bind(to_millis(agent.created_at))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_agent(&self, id: &AgentId) -> Result<Agent, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM agents WHERE id = ?", AGENT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StorageError::NotFound(format!("agent: {}", id)))?;
        agent_from_row(&row)
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StorageError> {
        let rows = sqlx::query(&format!("SELECT {} FROM agents ORDER BY hostname", AGENT_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn assign_policy(
        &self,
        policy_id: &PolicyId,
        agent_id: &AgentId,
    ) -> Result<(), StorageError> {
        self.get_policy(policy_id).await?;
        self.get_agent(agent_id).await?;

        sqlx::query("INSERT OR IGNORE INTO policy_agents (policy_id, agent_id) VALUES (?, ?)")
            .bind(policy_id.to_string())
            .bind(agent_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn unassign_policy(
        &self,
        policy_id: &PolicyId,
        agent_id: &AgentId,
    ) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM policy_agents WHERE policy_id = ? AND agent_id = ?")
            .bind(policy_id.to_string())
            .bind(agent_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn get_policy_agents(&self, policy_id: &PolicyId) -> Result<Vec<Agent>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.hostname, a.max_concurrent_tasks, a.tasks_in_backoff,
                a.earliest_retry_at, a.created_at
            FROM agents a
            JOIN policy_agents pa ON pa.agent_id = a.id
            WHERE pa.policy_id = ?
            ORDER BY a.hostname
            "#,
        )
        .bind(policy_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn update_agent_backoff(
        &self,
        agent_id: &AgentId,
        tasks_in_backoff: u32,
        earliest_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE agents SET tasks_in_backoff = ?, earliest_retry_at = ? WHERE id = ?",
        )
        .bind(i64::from(tasks_in_backoff))
        .bind(earliest_retry_at.map(to_millis))
        .bind(agent_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("agent: {}", agent_id)));
        }
        Ok(())
    }

    async fn get_policy_task_state(
        &self,
        policy_id: &PolicyId,
        task_type: TaskType,
    ) -> Result<Option<PolicyTaskState>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT policy_id, task_type, last_run, next_run, updated_at
            FROM policy_task_states WHERE policy_id = ? AND task_type = ?
            "#,
        )
        .bind(policy_id.to_string())
        .bind(task_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn seed_policy_task_state(
        &self,
        state: PolicyTaskState,
    ) -> Result<PolicyTaskState, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO policy_task_states (policy_id, task_type, last_run, next_run, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(policy_id, task_type) DO UPDATE SET
                next_run = excluded.next_run,
                updated_at = excluded.updated_at
            WHERE policy_task_states.next_run IS NULL
            "#,
        )
        .bind(state.policy_id.to_string())
        .bind(state.task_type.as_str())
        .bind(state.last_run.map(to_millis))
        .bind(state.next_run.map(to_millis))
        .bind(to_millis(state.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let row = sqlx::query(
            r#"
            SELECT policy_id, task_type, last_run, next_run, updated_at
            FROM policy_task_states WHERE policy_id = ? AND task_type = ?
            "#,
        )
        .bind(state.policy_id.to_string())
        .bind(state.task_type.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        state_from_row(&row)
    }

    async fn save_policy_task_state(&self, state: PolicyTaskState) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO policy_task_states (policy_id, task_type, last_run, next_run, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(policy_id, task_type) DO UPDATE SET
                last_run = excluded.last_run,
                next_run = excluded.next_run,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.policy_id.to_string())
        .bind(state.task_type.as_str())
        .bind(state.last_run.map(to_millis))
        .bind(state.next_run.map(to_millis))
        .bind(to_millis(state.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn list_policy_task_states(&self) -> Result<Vec<PolicyTaskState>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT policy_id, task_type, last_run, next_run, updated_at
            FROM policy_task_states
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut states: Vec<PolicyTaskState> =
            rows.iter().map(state_from_row).collect::<Result<_, _>>()?;
        states.sort_by(|a, b| {
            a.policy_id
                .cmp(&b.policy_id)
                .then(a.task_type.cmp(&b.task_type))
        });
        Ok(states)
    }

    async fn create_task(&self, task: Task) -> Result<(), StorageError> {
        let result = sqlx::query(&format!(
            "INSERT INTO tasks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TASK_COLUMNS
        ))
        .bind(task.id.to_string())
        .bind(task.agent_id.to_string())
        .bind(task.policy_id.to_string())
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(&task.repository)
        .bind(to_json(&task.include_paths)?)
        .bind(to_json(&task.exclude_paths)?)
        .bind(to_json(&task.retention)?)
        .bind(to_millis(task.scheduled_for))
        .bind(task.assigned_at.map(to_millis))
        .bind(task.acknowledged_at.map(to_millis))
        .bind(task.started_at.map(to_millis))
        .bind(task.completed_at.map(to_millis))
        .bind(&task.error_message)
        .bind(task.duration_seconds)
        .bind(&task.snapshot_id)
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(task.next_retry_at.map(to_millis))
        .bind(task.last_error_category.map(|c| c.as_str()))
        .bind(to_millis(task.created_at))
        .bind(to_millis(task.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("task: {}", task.id)))
            }
            Err(e) => Err(db_error(e)),
        }
    }

    async fn get_task(&self, id: &TaskId) -> Result<Task, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))?;
        task_from_row(&row)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StorageError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE (?1 IS NULL OR agent_id = ?1)
              AND (?2 IS NULL OR policy_id = ?2)
              AND (?3 IS NULL OR status = ?3)
              AND (?4 IS NULL OR task_type = ?4)
            ORDER BY scheduled_for, created_at, rowid
            "#,
            TASK_COLUMNS
        ))
        .bind(filter.agent_id.map(|id| id.to_string()))
        .bind(filter.policy_id.map(|id| id.to_string()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.task_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn claim_pending_tasks(
        &self,
        agent_id: &AgentId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Selection and update are one statement, so no row can be picked
        // by two claims.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE tasks SET status = 'assigned', assigned_at = ?1, updated_at = ?1
            WHERE id IN (
                SELECT id FROM tasks
                WHERE agent_id = ?2
                  AND status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                ORDER BY scheduled_for, created_at, rowid
                LIMIT ?3
            )
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(to_millis(now))
        .bind(agent_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        let mut tasks: Vec<Task> = rows.iter().map(task_from_row).collect::<Result<_, _>>()?;
        sort_by_schedule(&mut tasks);
        Ok(tasks)
    }

    async fn acknowledge_task(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<AckOutcome, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = 'in-progress', acknowledged_at = ?1, started_at = ?1,
                updated_at = ?1
            WHERE id = ?2 AND agent_id = ?3 AND status = 'assigned'
            "#,
        )
        .bind(to_millis(now))
        .bind(task_id.to_string())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let outcome = if result.rows_affected() == 1 {
            AckOutcome::Acknowledged
        } else {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM tasks WHERE id = ? AND agent_id = ?")
                    .bind(task_id.to_string())
                    .bind(agent_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_error)?;

            match status {
                None => AckOutcome::NotFound,
                Some(status) => match parse_column::<TaskStatus>(&status, "status")? {
                    TaskStatus::InProgress => AckOutcome::AlreadyAcknowledged,
                    other => AckOutcome::InvalidStatus(other),
                },
            }
        };

        tx.commit().await.map_err(db_error)?;
        Ok(outcome)
    }

    async fn update_task(&self, task: Task, expected: TaskStatus) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = ?, repository = ?, include_paths = ?, exclude_paths = ?,
                retention = ?, scheduled_for = ?, assigned_at = ?, acknowledged_at = ?,
                started_at = ?, completed_at = ?, error_message = ?, duration_seconds = ?,
                snapshot_id = ?, retry_count = ?, max_retries = ?, next_retry_at = ?,
                last_error_category = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(&task.repository)
        .bind(to_json(&task.include_paths)?)
        .bind(to_json(&task.exclude_paths)?)
        .bind(to_json(&task.retention)?)
        .bind(to_millis(task.scheduled_for))
        .bind(task.assigned_at.map(to_millis))
        .bind(task.acknowledged_at.map(to_millis))
        .bind(task.started_at.map(to_millis))
        .bind(task.completed_at.map(to_millis))
        .bind(&task.error_message)
        .bind(task.duration_seconds)
        .bind(&task.snapshot_id)
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(task.next_retry_at.map(to_millis))
        .bind(task.last_error_category.map(|c| c.as_str()))
        .bind(to_millis(task.updated_at))
        .bind(task.id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return match self.fetch_task_status(&task.id).await? {
                None => Err(StorageError::NotFound(format!("task: {}", task.id))),
                Some(current) => Err(StorageError::Conflict(format!(
                    "task {} is {}, expected {}",
                    task.id, current, expected
                ))),
            };
        }
        Ok(())
    }

    async fn list_backoff_tasks(
        &self,
        agent_id: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE agent_id = ? AND status = 'pending'
              AND next_retry_at IS NOT NULL AND next_retry_at > ?
            ORDER BY next_retry_at
            "#,
            TASK_COLUMNS
        ))
        .bind(agent_id.to_string())
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter().map(task_from_row).collect()
    }
}
