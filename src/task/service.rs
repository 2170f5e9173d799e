//! Locked task operations over the session store.
//!
//! Every mutation goes lock → load → pure transition → save. Reads that
//! tolerate slightly stale data (task views, health) skip the lock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{Error, QueueError, Result};
use crate::pipeline::ProcessOutcome;
use crate::session::accessor::SessionAccessor;
use crate::session::lock::{SessionGuard, SessionLocks};
use crate::session::model::SessionState;
use crate::task::lifecycle;
use crate::task::model::{Task, TaskStatus};
use crate::store::traits::{SessionCounts, Store};

/// A new change request arriving from the bridge.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub chat_id: String,
    pub source: String,
    pub user_input: String,
    pub dry_run: bool,
    pub webhook_url: Option<String>,
}

/// Where a freshly created task landed.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedTask {
    pub task_id: Uuid,
    /// "processing" when the task became active immediately, "queued"
    /// when it went behind a running task.
    pub status: &'static str,
    /// 0 for the active task, 1-based otherwise.
    pub position_in_queue: usize,
}

/// Read-only view of a task for API consumers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub chat_id: String,
    pub source: String,
    /// Coarse status: queued, in_progress, diff_ready, completed, error.
    pub status: &'static str,
    pub detailed_status: String,
    pub position_in_queue: usize,
    pub dry_run: bool,
    pub awaiting_input: bool,
    pub input_type: Option<String>,
    pub response: Option<String>,
    pub plan: Option<serde_json::Value>,
    pub diffs: Option<serde_json::Value>,
    pub written_files: Option<serde_json::Value>,
    pub error_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome buckets of a forced cleanup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub updated: Vec<Uuid>,
    pub skipped_terminal: Vec<Uuid>,
    pub not_found: Vec<Uuid>,
}

/// Task and session operations. Cheap to clone and share.
pub struct TaskService {
    store: Arc<dyn Store>,
    accessor: SessionAccessor,
    locks: SessionLocks,
    lock_wait: Duration,
    /// Tasks with a pipeline run in flight, from the background sweep
    /// or the synchronous input path. In-process only.
    running: Arc<Mutex<HashSet<Uuid>>>,
}

/// Exclusive claim on one task's pipeline execution. Dropping the slot
/// releases the claim.
pub(crate) struct ExecutionSlot {
    running: Arc<Mutex<HashSet<Uuid>>>,
    task_id: Uuid,
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.task_id);
        }
    }
}

impl TaskService {
    pub fn new(store: Arc<dyn Store>, worker: &WorkerConfig) -> Self {
        Self {
            accessor: SessionAccessor::new(Arc::clone(&store)),
            store,
            locks: SessionLocks::new(),
            lock_wait: worker.lock_wait,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim a task for pipeline execution. Returns `None` when a run
    /// for it is already in flight, so the sweep and the input path
    /// can never process the same task concurrently.
    pub(crate) fn try_begin_execution(&self, task_id: Uuid) -> Option<ExecutionSlot> {
        let mut running = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if running.insert(task_id) {
            Some(ExecutionSlot {
                running: Arc::clone(&self.running),
                task_id,
            })
        } else {
            None
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) async fn lock_session(
        &self,
        chat_id: &str,
        source: &str,
    ) -> Result<SessionGuard> {
        Ok(self.locks.acquire(chat_id, source, self.lock_wait).await?)
    }

    /// Accept a new change request. An idle session starts it right
    /// away; a busy one queues it FIFO.
    pub async fn create_task(&self, new: NewTask) -> Result<CreatedTask> {
        let _guard = self.lock_session(&new.chat_id, &new.source).await?;
        let mut state = self.accessor.load(&new.chat_id, &new.source).await?;

        let mut task = Task::new(&new.chat_id, &new.source, &new.user_input, TaskStatus::Queued);
        task.dry_run = new.dry_run;
        task.webhook_url = new.webhook_url;

        let created = if lifecycle::has_active_work(&state) {
            let task_id = task.task_id;
            let position = lifecycle::enqueue(&mut state, task)?;
            info!(%task_id, chat_id = %new.chat_id, source = %new.source, position, "task queued");
            CreatedTask {
                task_id,
                status: "queued",
                position_in_queue: position,
            }
        } else {
            let task_id = lifecycle::activate_first(&mut state, task);
            info!(%task_id, chat_id = %new.chat_id, source = %new.source, "task started");
            CreatedTask {
                task_id,
                status: "processing",
                position_in_queue: 0,
            }
        };

        self.accessor.save(&mut state).await?;
        Ok(created)
    }

    /// Unlocked read of a task and its queue position.
    pub async fn get_task_view(&self, task_id: Uuid) -> Result<TaskView> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(Error::TaskNotFound { id: task_id })?;

        let position = match self.store.find_session_by_task(task_id).await? {
            Some(session) => session
                .task_queue
                .iter()
                .position(|id| *id == task_id)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };

        Ok(TaskView {
            task_id: task.task_id,
            chat_id: task.chat_id,
            source: task.source,
            status: task.status.api_status(),
            detailed_status: task.status.to_string(),
            position_in_queue: position,
            dry_run: task.dry_run,
            awaiting_input: task.awaiting_response,
            input_type: task.awaiting_type,
            response: task.last_response,
            plan: task.plan,
            diffs: task.diffs,
            written_files: task.written_files,
            error_count: task.errors.len(),
            created_at: task.created_at,
            updated_at: task.updated_at,
        })
    }

    /// Resolve the session owning a task, erroring when the task is
    /// unknown.
    async fn session_of(&self, task_id: Uuid) -> Result<(String, String)> {
        match self.store.find_session_by_task(task_id).await? {
            Some(session) => Ok((session.chat_id, session.source)),
            None => {
                // A task row can exist before its session row does.
                let task = self
                    .store
                    .get_task(task_id)
                    .await?
                    .ok_or(Error::TaskNotFound { id: task_id })?;
                Ok((task.chat_id, task.source))
            }
        }
    }

    /// Validate that a follow-up input targets the active task and
    /// clear its awaiting flag. Returns the stored user input to hand
    /// to the pipeline along with the new message.
    pub async fn accept_input(&self, task_id: Uuid) -> Result<()> {
        let (chat_id, source) = self.session_of(task_id).await?;
        let _guard = self.lock_session(&chat_id, &source).await?;
        let mut state = self.accessor.load(&chat_id, &source).await?;

        if state.active_task_id != Some(task_id) {
            return Err(QueueError::TaskNotActive { id: task_id }.into());
        }

        if let Some(task) = state.tasks.get_mut(&task_id) {
            lifecycle::set_awaiting(task, false, None);
        }
        self.accessor.save(&mut state).await?;
        Ok(())
    }

    /// Record what a pipeline run produced. When the run did not pause
    /// for input the task is finalized and the queue advances; returns
    /// the promoted task id, if any.
    pub async fn record_outcome(
        &self,
        task_id: Uuid,
        outcome: &ProcessOutcome,
    ) -> Result<Option<Uuid>> {
        let (chat_id, source) = self.session_of(task_id).await?;
        let _guard = self.lock_session(&chat_id, &source).await?;
        let mut state = self.accessor.load(&chat_id, &source).await?;

        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Err(Error::TaskNotFound { id: task_id });
        };
        task.last_response = Some(outcome.response.clone());
        lifecycle::set_awaiting(task, outcome.awaiting_input, outcome.input_type.clone());

        let promoted = if outcome.awaiting_input {
            None
        } else {
            lifecycle::finalize_active(&mut state, task_id, TaskStatus::Completed)
        };

        self.accessor.save(&mut state).await?;
        Ok(promoted)
    }

    /// Fail a task, recording the reason. An active task's failure
    /// advances the queue; returns the promoted task id, if any.
    pub async fn fail_task(&self, task_id: Uuid, reason: &str) -> Result<Option<Uuid>> {
        let (chat_id, source) = self.session_of(task_id).await?;
        let _guard = self.lock_session(&chat_id, &source).await?;
        let mut state = self.accessor.load(&chat_id, &source).await?;

        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Err(Error::TaskNotFound { id: task_id });
        };
        task.add_error(reason);
        warn!(%task_id, %chat_id, %source, reason, "task failed");

        let promoted = if state.active_task_id == Some(task_id) {
            lifecycle::finalize_active(&mut state, task_id, TaskStatus::Failed)
        } else {
            if let Some(task) = state.tasks.get_mut(&task_id) {
                if lifecycle::apply_status(task, TaskStatus::Failed) {
                    state.task_queue.retain(|id| *id != task_id);
                }
            }
            None
        };

        self.accessor.save(&mut state).await?;
        Ok(promoted)
    }

    /// Finalize the active task with the given terminal status and
    /// advance the queue. Safe to call twice for the same task.
    pub async fn mark_task_completed(
        &self,
        task_id: Uuid,
        final_status: TaskStatus,
    ) -> Result<Option<Uuid>> {
        let (chat_id, source) = self.session_of(task_id).await?;
        let _guard = self.lock_session(&chat_id, &source).await?;
        let mut state = self.accessor.load(&chat_id, &source).await?;
        let promoted = lifecycle::finalize_active(&mut state, task_id, final_status);
        self.accessor.save(&mut state).await?;
        Ok(promoted)
    }

    /// Force-fail a batch of stuck tasks. Terminal tasks are left
    /// alone; unknown ids are reported, not errors.
    pub async fn cleanup_tasks(&self, task_ids: &[Uuid], reason: &str) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        for &task_id in task_ids {
            match self.store.get_task(task_id).await? {
                None => report.not_found.push(task_id),
                Some(task) if task.status.is_terminal() => {
                    report.skipped_terminal.push(task_id);
                }
                Some(_) => {
                    self.fail_task(task_id, reason).await?;
                    report.updated.push(task_id);
                }
            }
        }

        info!(
            updated = report.updated.len(),
            skipped_terminal = report.skipped_terminal.len(),
            not_found = report.not_found.len(),
            "task cleanup complete"
        );
        Ok(report)
    }

    /// Aggregate counts for the health endpoint.
    pub async fn health(&self) -> Result<SessionCounts> {
        self.store.health_check().await?;
        Ok(self.store.session_counts().await?)
    }

    /// Delete sessions untouched for longer than the retention window.
    /// Returns how many sessions were removed.
    pub async fn cleanup_old_sessions(&self, retention_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let stale = self.store.list_sessions_updated_before(cutoff).await?;
        let mut removed = 0;

        for session in stale {
            let _guard = self.lock_session(&session.chat_id, &session.source).await?;
            let tasks = self
                .store
                .delete_session(&session.chat_id, &session.source)
                .await?;
            info!(
                chat_id = %session.chat_id,
                source = %session.source,
                tasks,
                "stale session removed"
            );
            removed += 1;
        }
        Ok(removed)
    }

    /// Load a session under its lock and hand it to a closure. The
    /// closure reports whether it mutated the state; an untouched
    /// session is not written back, so idle sessions keep aging toward
    /// the retention cutoff. Used by the background sweep.
    pub(crate) async fn with_session<F, T>(&self, chat_id: &str, source: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut SessionState) -> (T, bool),
    {
        let _guard = self.lock_session(chat_id, source).await?;
        let mut state = self.accessor.load(chat_id, source).await?;
        let (out, dirty) = f(&mut state);
        if dirty && !state.is_empty() {
            self.accessor.save(&mut state).await?;
        }
        Ok(out)
    }
}
