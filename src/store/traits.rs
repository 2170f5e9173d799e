//! Unified `Store` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::session::model::Session;
use crate::task::model::Task;

/// Aggregate counts for the health endpoint.
#[derive(Debug, Clone, Default)]
pub struct SessionCounts {
    pub active_sessions: usize,
    pub active_tasks: usize,
    pub queue_length: usize,
    pub total_tasks: usize,
}

/// Backend-agnostic store covering sessions and tasks.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Get a session row. `Ok(None)` when the pair has never been seen.
    async fn get_session(&self, chat_id: &str, source: &str)
    -> Result<Option<Session>, StoreError>;

    /// Insert or update a session row, bumping `updated_at`.
    async fn upsert_session(&self, session: &Session) -> Result<(), StoreError>;

    /// List every session row.
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    /// List sessions whose `updated_at` is older than the cutoff.
    async fn list_sessions_updated_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError>;

    /// Delete a session and all of its tasks. Returns how many tasks
    /// went with it.
    async fn delete_session(&self, chat_id: &str, source: &str) -> Result<usize, StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert or fully replace a task row.
    async fn upsert_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Get a task by id.
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// All tasks belonging to a session, oldest first.
    async fn get_tasks_for_session(
        &self,
        chat_id: &str,
        source: &str,
    ) -> Result<Vec<Task>, StoreError>;

    /// Find the session row that owns a task.
    async fn find_session_by_task(&self, task_id: Uuid) -> Result<Option<Session>, StoreError>;

    // ── Aggregates ──────────────────────────────────────────────────

    /// Counts for the health endpoint.
    async fn session_counts(&self) -> Result<SessionCounts, StoreError>;

    /// Cheap connectivity check.
    async fn health_check(&self) -> Result<(), StoreError>;
}
