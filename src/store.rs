use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::cron::CronExpr;
use crate::error::{Result, StewardError};
use crate::model::{
    CheckStatus, Container, ContainerStatus, EventRecord, Execution, ExecutionStatus, HealthProbe,
    ImageVersion, Strategy, Task, TaskParams, UpdatePolicy, UpdateRecord, UpdateStatus,
};

/// Open (and migrate) the SQLite pool behind all default stores. For
/// `sqlite://` file URLs the parent directory and the file itself are created
/// up front; some sqlite builds fail to open a missing file instead of
/// creating it.
pub async fn open_pool(db_url: &str) -> Result<SqlitePool> {
    let trimmed = db_url.trim();
    if let Some(path) = trimmed.strip_prefix("sqlite://") {
        ensure_sqlite_storage(Path::new(path))?;
    }
    let max = if trimmed.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max)
        .connect(trimmed)
        .await?;
    crate::MIGRATOR.run(&pool).await.map_err(sqlx::Error::from)?;
    Ok(pool)
}

/// In-memory pool for tests. One connection, so every query sees the same
/// database.
pub async fn open_memory_pool() -> Result<SqlitePool> {
    open_pool("sqlite::memory:").await
}

fn ensure_sqlite_storage(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| {
                StewardError::Internal(format!(
                    "db-dir-create-failed path={} err={err}",
                    parent.display()
                ))
            })?;
        }
    }
    if !path.exists() {
        File::create(path).map_err(|err| {
            StewardError::Internal(format!(
                "db-file-create-failed path={} err={err}",
                path.display()
            ))
        })?;
    }
    Ok(())
}

fn secs(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_secs(value: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(value, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<()>;
    async fn save(&self, task: &Task) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Task>;
    async fn list_all(&self) -> Result<Vec<Task>>;
    /// Enabled tasks whose `next_run` has arrived. Disabled tasks and tasks
    /// without a computed `next_run` are never due.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;
    /// Rejects with `TaskBusy` while an execution for the task is open.
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a pending execution. Returns `false` when the
    /// `(task_id, scheduled_for)` dedupe key already exists — a re-delivered
    /// dispatch, not an error.
    async fn try_create(&self, exec: &Execution) -> Result<bool>;
    async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<()>;
    /// Move an open execution to a terminal status. Terminal rows are
    /// immutable; a second transition fails with `InvalidTransition`.
    async fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Execution>;
    async fn get_running(&self, task_id: &str) -> Result<Option<Execution>>;
    async fn count_running(&self) -> Result<u64>;
    async fn list_recent(&self, task_id: Option<&str>, limit: u32) -> Result<Vec<Execution>>;
    /// Startup reconciliation: any execution still open (pending or running)
    /// was abandoned by a previous process and is marked failed.
    async fn mark_abandoned(&self, error: &str, now: DateTime<Utc>) -> Result<u64>;
    async fn prune_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ContainerStore: Send + Sync {
    async fn insert(&self, container: &Container) -> Result<()>;
    async fn save(&self, container: &Container) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Container>;
    async fn get_by_name(&self, name: &str) -> Result<Container>;
    async fn list_all(&self) -> Result<Vec<Container>>;
    async fn list_auto_update(&self) -> Result<Vec<Container>>;
}

#[async_trait]
pub trait UpdateRecordStore: Send + Sync {
    /// Insert a pending record, claiming the per-container single-flight
    /// slot. Returns `false` when another update for the container is open.
    async fn try_begin(&self, record: &UpdateRecord) -> Result<bool>;
    async fn set_status(&self, id: &str, status: UpdateStatus, error: Option<&str>) -> Result<()>;
    async fn complete(
        &self,
        id: &str,
        status: UpdateStatus,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn get(&self, id: &str) -> Result<UpdateRecord>;
    async fn list_for_container(&self, container_id: &str, limit: u32)
    -> Result<Vec<UpdateRecord>>;
    async fn mark_abandoned(&self, error: &str, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ImageVersionStore: Send + Sync {
    async fn upsert(&self, version: &ImageVersion) -> Result<()>;
    async fn get(&self, image: &str) -> Result<Option<ImageVersion>>;
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, ts: DateTime<Utc>, action: &str, status: u16, meta: Value)
    -> Result<()>;
    async fn list_recent(&self, limit: u32) -> Result<Vec<EventRecord>>;
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Bundle of store handles wired to one backing pool.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn TaskStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub containers: Arc<dyn ContainerStore>,
    pub updates: Arc<dyn UpdateRecordStore>,
    pub image_versions: Arc<dyn ImageVersionStore>,
    pub events: Arc<dyn EventStore>,
}

impl Stores {
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self {
            tasks: Arc::new(SqliteTaskStore { pool: pool.clone() }),
            executions: Arc::new(SqliteExecutionStore { pool: pool.clone() }),
            containers: Arc::new(SqliteContainerStore { pool: pool.clone() }),
            updates: Arc::new(SqliteUpdateRecordStore { pool: pool.clone() }),
            image_versions: Arc::new(SqliteImageVersionStore { pool: pool.clone() }),
            events: Arc::new(SqliteEventStore { pool }),
        }
    }
}

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

fn task_row(row: &sqlx::sqlite::SqliteRow) -> Option<Task> {
    let id: String = row.get("id");
    let params_raw: String = row.get("params");
    let params: TaskParams = match serde_json::from_str(&params_raw) {
        Ok(params) => params,
        Err(err) => {
            warn!(task_id = %id, %err, "skipping task row with bad params json");
            return None;
        }
    };
    Some(Task {
        id,
        name: row.get("name"),
        schedule: row.get("schedule"),
        params,
        enabled: row.get::<i64, _>("enabled") != 0,
        next_run: row.get::<Option<i64>, _>("next_run").map(from_secs),
        last_run: row.get::<Option<i64>, _>("last_run").map(from_secs),
        created_by: row.get("created_by"),
        created_at: from_secs(row.get("created_at")),
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &Task) -> Result<()> {
        CronExpr::parse(&task.schedule)?;
        let params = serde_json::to_string(&task.params)
            .map_err(|err| StewardError::Internal(err.to_string()))?;
        sqlx::query(
            "INSERT INTO tasks (id, name, kind, schedule, params, enabled, next_run, last_run, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(task.kind().as_str())
        .bind(&task.schedule)
        .bind(params)
        .bind(task.enabled as i64)
        .bind(task.next_run.map(secs))
        .bind(task.last_run.map(secs))
        .bind(&task.created_by)
        .bind(secs(task.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save(&self, task: &Task) -> Result<()> {
        CronExpr::parse(&task.schedule)?;
        let params = serde_json::to_string(&task.params)
            .map_err(|err| StewardError::Internal(err.to_string()))?;
        let res = sqlx::query(
            "UPDATE tasks SET name = ?, kind = ?, schedule = ?, params = ?, enabled = ?,
                next_run = ?, last_run = ?, created_by = ? WHERE id = ?",
        )
        .bind(&task.name)
        .bind(task.kind().as_str())
        .bind(&task.schedule)
        .bind(params)
        .bind(task.enabled as i64)
        .bind(task.next_run.map(secs))
        .bind(task.last_run.map(secs))
        .bind(&task.created_by)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StewardError::NotFound {
                kind: "task",
                id: task.id.clone(),
            });
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().and_then(task_row).ok_or(StewardError::NotFound {
            kind: "task",
            id: id.to_string(),
        })
    }

    async fn list_all(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(task_row).collect())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?
             ORDER BY next_run",
        )
        .bind(secs(now))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(task_row).collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM executions WHERE task_id = ? AND status IN ('pending', 'running')",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if open > 0 {
            return Err(StewardError::TaskBusy(id.to_string()));
        }
        let res = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StewardError::NotFound {
                kind: "task",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

fn execution_row(row: &sqlx::sqlite::SqliteRow) -> Execution {
    Execution {
        id: row.get("id"),
        task_id: row.get("task_id"),
        status: ExecutionStatus::from_db(&row.get::<String, _>("status")),
        scheduled_for: from_secs(row.get("scheduled_for")),
        started_at: row.get::<Option<i64>, _>("started_at").map(from_secs),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_secs),
        error: row.get("error"),
        attempt: row.get::<i64, _>("attempt") as u32,
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn try_create(&self, exec: &Execution) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO executions (id, task_id, status, scheduled_for, started_at, completed_at, error, attempt)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&exec.id)
        .bind(&exec.task_id)
        .bind(exec.status.as_str())
        .bind(secs(exec.scheduled_for))
        .bind(exec.started_at.map(secs))
        .bind(exec.completed_at.map(secs))
        .bind(&exec.error)
        .bind(exec.attempt as i64)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let res = sqlx::query(
            "UPDATE executions SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(secs(started_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StewardError::InvalidTransition {
                entity: "execution",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let res = sqlx::query(
            "UPDATE executions SET status = ?, error = ?, completed_at = ?
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(secs(completed_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StewardError::InvalidTransition {
                entity: "execution",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Execution> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| execution_row(&row)).ok_or(StewardError::NotFound {
            kind: "execution",
            id: id.to_string(),
        })
    }

    async fn get_running(&self, task_id: &str) -> Result<Option<Execution>> {
        // Pending rows count: an execution created but not yet marked
        // running must still block a second dispatch.
        let row = sqlx::query(
            "SELECT * FROM executions WHERE task_id = ? AND status IN ('pending', 'running') LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| execution_row(&row)))
    }

    async fn count_running(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM executions WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn list_recent(&self, task_id: Option<&str>, limit: u32) -> Result<Vec<Execution>> {
        let rows = match task_id {
            Some(task_id) => {
                sqlx::query(
                    "SELECT * FROM executions WHERE task_id = ?
                     ORDER BY scheduled_for DESC LIMIT ?",
                )
                .bind(task_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM executions ORDER BY scheduled_for DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(execution_row).collect())
    }

    async fn mark_abandoned(&self, error: &str, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE executions SET status = 'failed', error = ?, completed_at = ?
             WHERE status IN ('pending', 'running')",
        )
        .bind(error)
        .bind(secs(now))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn prune_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM executions
             WHERE status IN ('success', 'failed', 'cancelled') AND completed_at < ?",
        )
        .bind(secs(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

pub struct SqliteContainerStore {
    pool: SqlitePool,
}

fn container_row(row: &sqlx::sqlite::SqliteRow) -> Container {
    let health: Option<String> = row.get("health");
    let health = health.and_then(|raw| match serde_json::from_str::<HealthProbe>(&raw) {
        Ok(probe) => Some(probe),
        Err(err) => {
            warn!(%err, "ignoring bad health probe json");
            None
        }
    });
    Container {
        id: row.get("id"),
        name: row.get("name"),
        image: row.get("image"),
        tag: row.get("tag"),
        digest: row.get("digest"),
        status: ContainerStatus::from_db(&row.get::<String, _>("status")),
        update_policy: UpdatePolicy::from_db(&row.get::<String, _>("update_policy")),
        strategy: Strategy::from_db(&row.get::<String, _>("strategy")),
        health,
        runtime_id: row.get("runtime_id"),
        last_auto_update: row.get::<Option<i64>, _>("last_auto_update").map(from_secs),
        created_by: row.get("created_by"),
        created_at: from_secs(row.get("created_at")),
    }
}

impl SqliteContainerStore {
    async fn upsert(&self, container: &Container, insert: bool) -> Result<()> {
        let health = container
            .health
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| StewardError::Internal(err.to_string()))?;
        if insert {
            sqlx::query(
                "INSERT INTO containers (id, name, image, tag, digest, status, update_policy, strategy, health, runtime_id, last_auto_update, created_by, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&container.id)
            .bind(&container.name)
            .bind(&container.image)
            .bind(&container.tag)
            .bind(&container.digest)
            .bind(container.status.as_str())
            .bind(container.update_policy.as_str())
            .bind(container.strategy.as_str())
            .bind(health)
            .bind(&container.runtime_id)
            .bind(container.last_auto_update.map(secs))
            .bind(&container.created_by)
            .bind(secs(container.created_at))
            .execute(&self.pool)
            .await?;
        } else {
            let res = sqlx::query(
                "UPDATE containers SET name = ?, image = ?, tag = ?, digest = ?, status = ?,
                    update_policy = ?, strategy = ?, health = ?, runtime_id = ?, last_auto_update = ?
                 WHERE id = ?",
            )
            .bind(&container.name)
            .bind(&container.image)
            .bind(&container.tag)
            .bind(&container.digest)
            .bind(container.status.as_str())
            .bind(container.update_policy.as_str())
            .bind(container.strategy.as_str())
            .bind(health)
            .bind(&container.runtime_id)
            .bind(container.last_auto_update.map(secs))
            .bind(&container.id)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 0 {
                return Err(StewardError::NotFound {
                    kind: "container",
                    id: container.id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerStore for SqliteContainerStore {
    async fn insert(&self, container: &Container) -> Result<()> {
        self.upsert(container, true).await
    }

    async fn save(&self, container: &Container) -> Result<()> {
        self.upsert(container, false).await
    }

    async fn get(&self, id: &str) -> Result<Container> {
        let row = sqlx::query("SELECT * FROM containers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| container_row(&row)).ok_or(StewardError::NotFound {
            kind: "container",
            id: id.to_string(),
        })
    }

    async fn get_by_name(&self, name: &str) -> Result<Container> {
        let row = sqlx::query("SELECT * FROM containers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| container_row(&row)).ok_or(StewardError::NotFound {
            kind: "container",
            id: name.to_string(),
        })
    }

    async fn list_all(&self) -> Result<Vec<Container>> {
        let rows = sqlx::query("SELECT * FROM containers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(container_row).collect())
    }

    async fn list_auto_update(&self) -> Result<Vec<Container>> {
        let rows = sqlx::query("SELECT * FROM containers WHERE update_policy = 'auto' ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(container_row).collect())
    }
}

pub struct SqliteUpdateRecordStore {
    pool: SqlitePool,
}

fn update_row(row: &sqlx::sqlite::SqliteRow) -> UpdateRecord {
    UpdateRecord {
        id: row.get("id"),
        container_id: row.get("container_id"),
        from_ref: row.get("from_ref"),
        to_ref: row.get("to_ref"),
        strategy: Strategy::from_db(&row.get::<String, _>("strategy")),
        status: UpdateStatus::from_db(&row.get::<String, _>("status")),
        started_at: from_secs(row.get("started_at")),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_secs),
        error: row.get("error"),
    }
}

#[async_trait]
impl UpdateRecordStore for SqliteUpdateRecordStore {
    async fn try_begin(&self, record: &UpdateRecord) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO update_records (id, container_id, from_ref, to_ref, strategy, status, started_at, completed_at, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.container_id)
        .bind(&record.from_ref)
        .bind(&record.to_ref)
        .bind(record.strategy.as_str())
        .bind(record.status.as_str())
        .bind(secs(record.started_at))
        .bind(record.completed_at.map(secs))
        .bind(&record.error)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_status(&self, id: &str, status: UpdateStatus, error: Option<&str>) -> Result<()> {
        let res = sqlx::query(
            "UPDATE update_records SET status = ?, error = ?
             WHERE id = ? AND status IN ('pending', 'in-progress')",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StewardError::InvalidTransition {
                entity: "update record",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: &str,
        status: UpdateStatus,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let res = sqlx::query(
            "UPDATE update_records SET status = ?, error = ?, completed_at = ?
             WHERE id = ? AND status IN ('pending', 'in-progress')",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(secs(completed_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StewardError::InvalidTransition {
                entity: "update record",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<UpdateRecord> {
        let row = sqlx::query("SELECT * FROM update_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| update_row(&row)).ok_or(StewardError::NotFound {
            kind: "update record",
            id: id.to_string(),
        })
    }

    async fn list_for_container(
        &self,
        container_id: &str,
        limit: u32,
    ) -> Result<Vec<UpdateRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM update_records WHERE container_id = ?
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(container_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(update_row).collect())
    }

    async fn mark_abandoned(&self, error: &str, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE update_records SET status = 'failed', error = ?, completed_at = ?
             WHERE status IN ('pending', 'in-progress')",
        )
        .bind(error)
        .bind(secs(now))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

pub struct SqliteImageVersionStore {
    pool: SqlitePool,
}

#[async_trait]
impl ImageVersionStore for SqliteImageVersionStore {
    async fn upsert(&self, version: &ImageVersion) -> Result<()> {
        sqlx::query(
            "INSERT INTO image_versions (image, registry, tag, digest, is_latest, status, error, checked_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(image) DO UPDATE SET
               digest = excluded.digest,
               is_latest = excluded.is_latest,
               status = excluded.status,
               error = excluded.error,
               checked_at = excluded.checked_at",
        )
        .bind(&version.image)
        .bind(&version.registry)
        .bind(&version.tag)
        .bind(&version.digest)
        .bind(version.is_latest as i64)
        .bind(version.status.as_str())
        .bind(&version.error)
        .bind(secs(version.checked_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, image: &str) -> Result<Option<ImageVersion>> {
        let row = sqlx::query("SELECT * FROM image_versions WHERE image = ?")
            .bind(image)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| ImageVersion {
            image: row.get("image"),
            registry: row.get("registry"),
            tag: row.get("tag"),
            digest: row.get("digest"),
            is_latest: row.get::<i64, _>("is_latest") != 0,
            status: CheckStatus::from_db(&row.get::<String, _>("status")),
            error: row.get("error"),
            checked_at: from_secs(row.get("checked_at")),
        }))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM image_versions WHERE checked_at < ?")
            .bind(secs(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

pub struct SqliteEventStore {
    pool: SqlitePool,
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(
        &self,
        ts: DateTime<Utc>,
        action: &str,
        status: u16,
        meta: Value,
    ) -> Result<()> {
        sqlx::query("INSERT INTO event_log (ts, action, status, meta) VALUES (?, ?, ?, ?)")
            .bind(secs(ts))
            .bind(action)
            .bind(status as i64)
            .bind(meta.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query("SELECT * FROM event_log ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| EventRecord {
                id: row.get("id"),
                ts: from_secs(row.get("ts")),
                action: row.get("action"),
                status: row.get::<i64, _>("status") as u16,
                meta: serde_json::from_str(&row.get::<String, _>("meta"))
                    .unwrap_or(Value::Null),
            })
            .collect())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM event_log WHERE ts < ?")
            .bind(secs(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
