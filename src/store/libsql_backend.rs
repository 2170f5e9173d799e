//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! RFC 3339 TEXT; queue and error columns hold JSON arrays.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::session::model::Session;
use crate::store::migrations;
use crate::store::traits::{SessionCounts, Store};
use crate::task::model::{Task, TaskError, TaskStatus};

/// libSQL store.
///
/// Holds a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

/// Parse a JSON array of task ids, dropping anything unparseable.
fn parse_queue(s: &str) -> Vec<Uuid> {
    serde_json::from_str::<Vec<String>>(s)
        .unwrap_or_default()
        .iter()
        .filter_map(|id| Uuid::parse_str(id).ok())
        .collect()
}

fn queue_to_json(queue: &[Uuid]) -> String {
    serde_json::to_string(&queue.iter().map(Uuid::to_string).collect::<Vec<_>>())
        .unwrap_or_else(|_| "[]".to_string())
}

/// Map a libsql row to a Session.
///
/// Column order: 0:chat_id, 1:source, 2:active_task_id, 3:task_queue,
/// 4:created_at, 5:updated_at
fn row_to_session(row: &libsql::Row) -> Result<Session, libsql::Error> {
    let chat_id: String = row.get(0)?;
    let source: String = row.get(1)?;
    let active_str: Option<String> = row.get(2).ok();
    let queue_str: String = row.get(3)?;
    let created_str: String = row.get(4)?;
    let updated_str: String = row.get(5)?;

    Ok(Session {
        chat_id,
        source,
        active_task_id: active_str.and_then(|s| Uuid::parse_str(&s).ok()),
        task_queue: parse_queue(&queue_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const TASK_COLUMNS: &str = "task_id, chat_id, source, status, user_input, dry_run, webhook_url, \
     plan, diffs, written_files, last_response, errors, retry_count, \
     awaiting_response, awaiting_type, created_at, updated_at, completed_at";

/// Map a libsql row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    let id_str: String = row.get(0)?;
    let chat_id: String = row.get(1)?;
    let source: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let user_input: String = row.get(4)?;
    let dry_run: i64 = row.get(5)?;
    let webhook_url: Option<String> = row.get(6).ok();
    let plan: Option<String> = row.get(7).ok();
    let diffs: Option<String> = row.get(8).ok();
    let written_files: Option<String> = row.get(9).ok();
    let last_response: Option<String> = row.get(10).ok();
    let errors_str: String = row.get(11)?;
    let retry_count: i64 = row.get(12)?;
    let awaiting_response: i64 = row.get(13)?;
    let awaiting_type: Option<String> = row.get(14).ok();
    let created_str: String = row.get(15)?;
    let updated_str: String = row.get(16)?;
    let completed_str: Option<String> = row.get(17).ok();

    Ok(Task {
        task_id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        chat_id,
        source,
        status: status_str.parse().unwrap_or(TaskStatus::Queued),
        user_input,
        dry_run: dry_run != 0,
        webhook_url,
        plan: plan.and_then(|s| serde_json::from_str(&s).ok()),
        diffs: diffs.and_then(|s| serde_json::from_str(&s).ok()),
        written_files: written_files.and_then(|s| serde_json::from_str(&s).ok()),
        last_response,
        errors: serde_json::from_str::<Vec<TaskError>>(&errors_str).unwrap_or_default(),
        retry_count: retry_count.max(0) as u32,
        awaiting_response: awaiting_response != 0,
        awaiting_type,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        completed_at: parse_optional_datetime(completed_str),
    })
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn json_column(value: &Option<serde_json::Value>) -> Result<libsql::Value, StoreError> {
    match value {
        Some(v) => serde_json::to_string(v)
            .map(libsql::Value::Text)
            .map_err(|e| StoreError::Serialization(e.to_string())),
        None => Ok(libsql::Value::Null),
    }
}

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn get_session(
        &self,
        chat_id: &str,
        source: &str,
    ) -> Result<Option<Session>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT chat_id, source, active_task_id, task_queue, created_at, updated_at
                 FROM sessions WHERE chat_id = ?1 AND source = ?2",
                params![chat_id, source],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_session failed: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_session read failed: {e}")))?
        {
            Some(row) => Ok(Some(row_to_session(&row).map_err(|e| {
                StoreError::Query(format!("get_session row mapping failed: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn upsert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO sessions (chat_id, source, active_task_id, task_queue, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (chat_id, source) DO UPDATE SET
                     active_task_id = excluded.active_task_id,
                     task_queue = excluded.task_queue,
                     updated_at = excluded.updated_at",
                params![
                    session.chat_id.as_str(),
                    session.source.as_str(),
                    opt_text_owned(session.active_task_id.map(|id| id.to_string())),
                    queue_to_json(&session.task_queue),
                    session.created_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_session failed: {e}")))?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT chat_id, source, active_task_id, task_queue, created_at, updated_at
                 FROM sessions ORDER BY updated_at",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_sessions failed: {e}")))?;

        let mut sessions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("list_sessions read failed: {e}")))?
        {
            sessions.push(row_to_session(&row).map_err(|e| {
                StoreError::Query(format!("list_sessions row mapping failed: {e}"))
            })?);
        }
        Ok(sessions)
    }

    async fn list_sessions_updated_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT chat_id, source, active_task_id, task_queue, created_at, updated_at
                 FROM sessions WHERE updated_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_sessions_updated_before failed: {e}")))?;

        let mut sessions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("stale session read failed: {e}")))?
        {
            sessions.push(row_to_session(&row).map_err(|e| {
                StoreError::Query(format!("stale session row mapping failed: {e}"))
            })?);
        }
        Ok(sessions)
    }

    async fn delete_session(&self, chat_id: &str, source: &str) -> Result<usize, StoreError> {
        let tasks_deleted = self
            .conn()
            .execute(
                "DELETE FROM tasks WHERE chat_id = ?1 AND source = ?2",
                params![chat_id, source],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_session tasks failed: {e}")))?;

        self.conn()
            .execute(
                "DELETE FROM sessions WHERE chat_id = ?1 AND source = ?2",
                params![chat_id, source],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_session failed: {e}")))?;

        Ok(tasks_deleted as usize)
    }

    async fn upsert_task(&self, task: &Task) -> Result<(), StoreError> {
        let errors = serde_json::to_string(&task.errors)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                     ON CONFLICT (task_id) DO UPDATE SET
                         status = excluded.status,
                         user_input = excluded.user_input,
                         dry_run = excluded.dry_run,
                         webhook_url = excluded.webhook_url,
                         plan = excluded.plan,
                         diffs = excluded.diffs,
                         written_files = excluded.written_files,
                         last_response = excluded.last_response,
                         errors = excluded.errors,
                         retry_count = excluded.retry_count,
                         awaiting_response = excluded.awaiting_response,
                         awaiting_type = excluded.awaiting_type,
                         updated_at = excluded.updated_at,
                         completed_at = excluded.completed_at"
                ),
                params![
                    task.task_id.to_string(),
                    task.chat_id.as_str(),
                    task.source.as_str(),
                    task.status.to_string(),
                    task.user_input.as_str(),
                    task.dry_run as i64,
                    opt_text_owned(task.webhook_url.clone()),
                    json_column(&task.plan)?,
                    json_column(&task.diffs)?,
                    json_column(&task.written_files)?,
                    opt_text_owned(task.last_response.clone()),
                    errors,
                    task.retry_count as i64,
                    task.awaiting_response as i64,
                    opt_text_owned(task.awaiting_type.clone()),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                    opt_text_owned(task.completed_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_task failed: {e}")))?;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_task failed: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_task read failed: {e}")))?
        {
            Some(row) => Ok(Some(row_to_task(&row).map_err(|e| {
                StoreError::Query(format!("get_task row mapping failed: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn get_tasks_for_session(
        &self,
        chat_id: &str,
        source: &str,
    ) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE chat_id = ?1 AND source = ?2 ORDER BY created_at"
                ),
                params![chat_id, source],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_tasks_for_session failed: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("session task read failed: {e}")))?
        {
            tasks.push(row_to_task(&row).map_err(|e| {
                StoreError::Query(format!("session task row mapping failed: {e}"))
            })?);
        }
        Ok(tasks)
    }

    async fn find_session_by_task(&self, task_id: Uuid) -> Result<Option<Session>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT s.chat_id, s.source, s.active_task_id, s.task_queue, s.created_at, s.updated_at
                 FROM sessions s JOIN tasks t ON t.chat_id = s.chat_id AND t.source = s.source
                 WHERE t.task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("find_session_by_task failed: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("find_session_by_task read failed: {e}")))?
        {
            Some(row) => Ok(Some(row_to_session(&row).map_err(|e| {
                StoreError::Query(format!("find_session_by_task row mapping failed: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn session_counts(&self) -> Result<SessionCounts, StoreError> {
        let mut counts = SessionCounts::default();

        for session in self.list_sessions().await? {
            if session.active_task_id.is_some() {
                counts.active_sessions += 1;
            }
            counts.queue_length += session.task_queue.len();
        }

        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*),
                        SUM(CASE WHEN status NOT IN ('completed', 'failed', 'rolled_back')
                            THEN 1 ELSE 0 END)
                 FROM tasks",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("session_counts failed: {e}")))?;

        if let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("session_counts read failed: {e}")))?
        {
            let total: i64 = row.get(0).unwrap_or(0);
            let active: i64 = row.get(1).unwrap_or(0);
            counts.total_tasks = total.max(0) as usize;
            counts.active_tasks = active.max(0) as usize;
        }

        Ok(counts)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| StoreError::Query(format!("health check failed: {e}")))?;
        Ok(())
    }
}
