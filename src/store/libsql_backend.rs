//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Every transition is one
//! guarded `UPDATE`, so a concurrent reader never observes a half-applied
//! change and a stale transition can never clobber a newer state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TaskLimits;
use crate::error::{DatabaseError, TaskError};
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::tasks::{
    Parameters, RESTART_FAILURE_REASON, Task, TaskId, TaskPage, TaskSpec, TaskStatus,
    TaskTransition,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    limits: TaskLimits,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, limits: TaskLimits) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            limits,
        };
        store.enable_wal().await?;
        store.init_schema().await?;
        info!(path = %path.display(), "Task database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(limits: TaskLimits) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            limits,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::init_schema(self.conn()).await
    }

    /// Readers keep working while the worker writes.
    async fn enable_wal(&self) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()
            .query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;
        if let Ok(Some(row)) = rows.next().await {
            let mode: String = row.get(0).unwrap_or_default();
            if !mode.eq_ignore_ascii_case("wal") {
                warn!(mode = %mode, "WAL journal mode not available");
            }
        }
        Ok(())
    }

    /// Read the current status of a task, `None` if it does not exist.
    async fn current_status(&self, id: TaskId) -> Result<Option<TaskStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM tasks WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("current_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("current_status row: {e}")))?;
                raw.parse()
                    .map(Some)
                    .map_err(DatabaseError::Serialization)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("current_status: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed-width so text comparison matches time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("timestamp {s:?}: {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

/// `status IN (...)` clause listing every status that accepts `transition`.
fn allowed_from_clause(transition: &TaskTransition) -> String {
    let allowed: Vec<String> = TaskStatus::ALL
        .into_iter()
        .filter(|s| transition.is_allowed_from(*s))
        .map(|s| format!("'{}'", s.as_str()))
        .collect();
    format!("status IN ({})", allowed.join(", "))
}

const TASK_COLUMNS: &str = "id, target, instructions, parameters, callback_endpoint, timeout_ms, status, result, failure_reason, callback_attempts, last_callback_error, created_at, started_at, completed_at";

/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("task row: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let params_str: String = row.get(3).map_err(get_err)?;
    let timeout_ms: i64 = row.get(5).map_err(get_err)?;
    let status_str: String = row.get(6).map_err(get_err)?;
    let attempts: i64 = row.get(9).map_err(get_err)?;
    let created_str: String = row.get(11).map_err(get_err)?;
    let started_str: Option<String> = row.get(12).map_err(get_err)?;
    let completed_str: Option<String> = row.get(13).map_err(get_err)?;

    Ok(Task {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("task id {id_str:?}: {e}")))?,
        target: row.get(1).map_err(get_err)?,
        instructions: row.get(2).map_err(get_err)?,
        parameters: Parameters::from_json(&params_str)
            .map_err(|e| DatabaseError::Serialization(format!("task parameters: {e}")))?,
        callback_endpoint: row.get::<Option<String>>(4).map_err(get_err)?,
        timeout: Duration::from_millis(timeout_ms.max(0) as u64),
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        result: row.get::<Option<String>>(7).map_err(get_err)?,
        failure_reason: row.get::<Option<String>>(8).map_err(get_err)?,
        callback_attempts: u32::try_from(attempts.max(0)).unwrap_or(u32::MAX),
        last_callback_error: row.get::<Option<String>>(10).map_err(get_err)?,
        created_at: parse_datetime(&created_str)?,
        started_at: parse_optional_datetime(started_str)?,
        completed_at: parse_optional_datetime(completed_str)?,
    })
}

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn create(&self, spec: TaskSpec) -> Result<Task, TaskError> {
        let timeout = spec.validate(&self.limits)?;
        let task = Task::queued(spec, timeout, Utc::now());

        let params_json = task
            .parameters
            .to_json()
            .map_err(|e| DatabaseError::Serialization(format!("task parameters: {e}")))?;
        let timeout_ms = i64::try_from(task.timeout.as_millis()).unwrap_or(i64::MAX);

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, 0, NULL, ?8, NULL, NULL)"
                ),
                params![
                    task.id.to_string(),
                    task.target.as_str(),
                    task.instructions.as_str(),
                    params_json,
                    task.callback_endpoint.as_deref(),
                    timeout_ms,
                    task.status.as_str(),
                    format_datetime(&task.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        debug!(task_id = %task.id, target = %task.target, "Task inserted into DB");
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}")).into()),
        }
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<TaskPage, TaskError> {
        let limit = limit.clamp(1, self.limits.max_list_limit.max(1));
        let status_str = status.map(|s| s.as_str());

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2 OFFSET ?3"
                ),
                params![status_str, i64::from(limit), i64::from(offset)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }

        let mut count_rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE (?1 IS NULL OR status = ?1)",
                params![status_str],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_tasks: {e}")))?;
        let total = match count_rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("count_tasks row: {e}")))?,
            Ok(None) => 0,
            Err(e) => return Err(DatabaseError::Query(format!("count_tasks: {e}")).into()),
        };

        Ok(TaskPage {
            tasks,
            total: total.max(0) as u64,
            limit,
            offset,
        })
    }

    async fn update(&self, id: TaskId, transition: TaskTransition) -> Result<(), TaskError> {
        let guard = allowed_from_clause(&transition);
        let id_str = id.to_string();
        let conn = self.conn();

        // Timestamps never run backwards relative to earlier lifecycle stamps.
        let changed = match &transition {
            TaskTransition::MarkRunning { at } => {
                conn.execute(
                    &format!(
                        "UPDATE tasks SET status = ?1, started_at = MAX(?2, created_at)
                         WHERE id = ?3 AND {guard}"
                    ),
                    params![TaskStatus::Running.as_str(), format_datetime(at), id_str],
                )
                .await
            }
            TaskTransition::MarkCompleted { result, at } => {
                conn.execute(
                    &format!(
                        "UPDATE tasks SET status = ?1, result = ?2, failure_reason = NULL,
                             completed_at = MAX(?3, COALESCE(started_at, created_at))
                         WHERE id = ?4 AND {guard}"
                    ),
                    params![
                        TaskStatus::Completed.as_str(),
                        result.as_str(),
                        format_datetime(at),
                        id_str
                    ],
                )
                .await
            }
            TaskTransition::MarkFailed { reason, at }
            | TaskTransition::MarkTimedOut { reason, at } => {
                let target = transition.target().unwrap_or(TaskStatus::Failed);
                conn.execute(
                    &format!(
                        "UPDATE tasks SET status = ?1, result = NULL, failure_reason = ?2,
                             completed_at = MAX(?3, COALESCE(started_at, created_at))
                         WHERE id = ?4 AND {guard}"
                    ),
                    params![target.as_str(), reason.as_str(), format_datetime(at), id_str],
                )
                .await
            }
            TaskTransition::RecordCallbackAttempt { attempts, error } => {
                conn.execute(
                    &format!(
                        "UPDATE tasks SET callback_attempts = MAX(callback_attempts, ?1),
                             last_callback_error = ?2
                         WHERE id = ?3 AND {guard}"
                    ),
                    params![i64::from(*attempts), error.as_deref(), id_str],
                )
                .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("update_task {}: {e}", transition.name())))?;

        if changed > 0 {
            debug!(task_id = %id, transition = transition.name(), "Task updated in DB");
            return Ok(());
        }

        match self.current_status(id).await? {
            None => Err(TaskError::NotFound { id }),
            Some(state) => Err(TaskError::InvalidTransition {
                id,
                state,
                target: transition.name().to_string(),
            }),
        }
    }

    async fn delete(&self, id: TaskId) -> Result<bool, TaskError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;

        debug!(task_id = %id, deleted = deleted > 0, "Task delete");
        Ok(deleted > 0)
    }

    async fn reconcile_on_startup(&self) -> Result<u64, TaskError> {
        let active: Vec<String> = TaskStatus::ALL
            .into_iter()
            .filter(TaskStatus::is_recoverable)
            .map(|s| format!("'{}'", s.as_str()))
            .collect();

        let reconciled = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET status = ?1, result = NULL, failure_reason = ?2,
                         completed_at = MAX(?3, COALESCE(started_at, created_at))
                     WHERE status IN ({})",
                    active.join(", ")
                ),
                params![
                    TaskStatus::Failed.as_str(),
                    RESTART_FAILURE_REASON,
                    format_datetime(&Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reconcile_on_startup: {e}")))?;

        Ok(reconciled)
    }

    async fn ping(&self) -> Result<(), TaskError> {
        let mut rows = self
            .conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        Ok(())
    }
}
