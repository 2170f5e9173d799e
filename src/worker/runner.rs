//! Background sweep over all sessions.
//!
//! Each iteration re-reads session state from the store, re-drives
//! orphaned work, advances queues, enforces the awaiting-response
//! timeout, and dispatches runnable tasks to the pipeline. The loop
//! holds nothing the store doesn't, so a restart resumes cleanly.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::pipeline::{NotificationSink, Pipeline};
use crate::session::model::SessionState;
use crate::task::lifecycle;
use crate::task::service::{ExecutionSlot, TaskService};

/// A task the sweep decided to hand to the pipeline.
struct Dispatch {
    task_id: Uuid,
    user_input: String,
    webhook_url: Option<String>,
}

pub struct WorkerLoop {
    service: Arc<TaskService>,
    pipeline: Arc<dyn Pipeline>,
    notifier: Arc<dyn NotificationSink>,
    config: WorkerConfig,
}

impl WorkerLoop {
    pub fn new(
        service: Arc<TaskService>,
        pipeline: Arc<dyn Pipeline>,
        notifier: Arc<dyn NotificationSink>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            pipeline,
            notifier,
            config,
        })
    }

    /// Start the sweep loop. Returns `None` when the interval is zero.
    pub fn spawn(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if self.config.poll_interval.is_zero() {
            info!("worker loop disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut iteration: u64 = 0;

            loop {
                ticker.tick().await;
                iteration += 1;
                if let Err(e) = self.sweep_all(iteration).await {
                    error!(iteration, error = %e, "sweep iteration failed");
                }
            }
        }))
    }

    /// One pass over every session. A failure in one session never
    /// stalls the rest.
    pub async fn sweep_all(&self, iteration: u64) -> Result<()> {
        let sessions = self.service.store().list_sessions().await?;
        debug!(iteration, sessions = sessions.len(), "sweep started");

        for session in sessions {
            match self.sweep_session(&session.chat_id, &session.source).await {
                Ok(()) => {}
                Err(Error::Lock(_)) => {
                    debug!(
                        iteration,
                        chat_id = %session.chat_id,
                        source = %session.source,
                        "session busy, skipping"
                    );
                }
                Err(e) => {
                    error!(
                        iteration,
                        chat_id = %session.chat_id,
                        source = %session.source,
                        error = %e,
                        "session sweep failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Sweep one session under its lock, then dispatch outside it.
    pub async fn sweep_session(&self, chat_id: &str, source: &str) -> Result<()> {
        let threshold = self.config.awaiting_timeout_minutes;
        let dispatch = self
            .service
            .with_session(chat_id, source, |state| Self::plan_session(state, threshold))
            .await?;

        if let Some(dispatch) = dispatch {
            if let Some(slot) = self.service.try_begin_execution(dispatch.task_id) {
                self.spawn_execution(dispatch, slot);
            }
        }
        Ok(())
    }

    /// Pure per-session decision: repair, advance, time out, and pick
    /// at most one task to run. Runs under the session lock. The bool
    /// in the return reports whether the state was mutated and needs
    /// to be written back.
    fn plan_session(state: &mut SessionState, timeout_minutes: i64) -> (Option<Dispatch>, bool) {
        if state.is_empty() {
            return (None, false);
        }
        let mut dirty = false;

        // A terminal active pointer means a completion signal was lost;
        // clear it and let the queue move.
        if let Some(active) = state.active_task() {
            if active.status.is_terminal() {
                let id = active.task_id;
                state.active_task_id = None;
                dirty = true;
                debug!(task_id = %id, "cleared terminal active pointer");
            }
        }

        if state.active_task_id.is_none() {
            if let Some(promoted) = lifecycle::promote_next(state) {
                dirty = true;
                info!(task_id = %promoted, chat_id = %state.chat_id, "promoted queued task");
            }
        }

        // Awaiting-response timeout. Zero disables it.
        if timeout_minutes > 0 {
            if let Some(active) = state.active_task() {
                let age = active.age_minutes(chrono::Utc::now());
                if active.awaiting_response
                    && active.status.can_await_input()
                    && age > timeout_minutes
                {
                    let id = active.task_id;
                    warn!(
                        task_id = %id,
                        chat_id = %state.chat_id,
                        age_minutes = age,
                        "awaiting-response timeout"
                    );
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.add_error(format!(
                            "awaiting_timeout: no response after {age} minutes \
                             (threshold {timeout_minutes})"
                        ));
                    }
                    let promoted =
                        lifecycle::finalize_active(state, id, crate::task::model::TaskStatus::Failed);
                    dirty = true;
                    if let Some(promoted) = promoted {
                        info!(task_id = %promoted, "promoted after timeout");
                    }
                }
            }
        }

        let dispatch = match state.active_task() {
            Some(active) if !active.status.is_terminal() && !active.awaiting_response => {
                Some(Dispatch {
                    task_id: active.task_id,
                    user_input: active.user_input.clone(),
                    webhook_url: active.webhook_url.clone(),
                })
            }
            _ => None,
        };
        (dispatch, dirty)
    }

    /// Run the pipeline for one task in the background, bounded by the
    /// execution timeout. The slot is held until the run settles.
    fn spawn_execution(&self, dispatch: Dispatch, slot: ExecutionSlot) {
        let service = Arc::clone(&self.service);
        let pipeline = Arc::clone(&self.pipeline);
        let notifier = Arc::clone(&self.notifier);
        let timeout = self.config.task_execution_timeout;
        let task_id = dispatch.task_id;

        tokio::spawn(async move {
            let _slot = slot;
            info!(%task_id, "task execution started");
            let result =
                tokio::time::timeout(timeout, pipeline.process(task_id, &dispatch.user_input))
                    .await;

            let outcome = match result {
                Err(_) => {
                    let reason =
                        format!("worker_timeout: timed out after {}s", timeout.as_secs());
                    if let Err(e) = service.fail_task(task_id, &reason).await {
                        error!(%task_id, error = %e, "failed to record task timeout");
                    }
                    None
                }
                Ok(Err(e)) => {
                    if let Err(e) = service.fail_task(task_id, &format!("pipeline error: {e}")).await
                    {
                        error!(%task_id, error = %e, "failed to record pipeline error");
                    }
                    None
                }
                Ok(Ok(outcome)) => {
                    match service.record_outcome(task_id, &outcome).await {
                        Ok(promoted) => {
                            if let Some(promoted) = promoted {
                                info!(%task_id, next = %promoted, "task finished, queue advanced");
                            }
                        }
                        Err(e) => {
                            error!(%task_id, error = %e, "failed to record task outcome");
                        }
                    }
                    Some(outcome)
                }
            };

            if let (Some(outcome), Some(url)) = (outcome, dispatch.webhook_url) {
                if let Err(e) = notifier.notify(&url, task_id, &outcome.response).await {
                    warn!(%task_id, error = %e, "webhook notification failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use crate::config::WorkerConfig;
    use crate::error::PipelineError;
    use crate::pipeline::ProcessOutcome;
    use crate::session::model::Session;
    use crate::store::libsql_backend::LibSqlStore;
    use crate::task::model::{Task, TaskStatus};
    use crate::task::service::NewTask;

    struct MockPipeline {
        delay: Duration,
        outcome: ProcessOutcome,
        calls: std::sync::Mutex<Vec<Uuid>>,
    }

    impl MockPipeline {
        fn instant(response: &str) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::ZERO,
                outcome: ProcessOutcome {
                    response: response.to_string(),
                    awaiting_input: false,
                    input_type: None,
                },
                calls: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                outcome: ProcessOutcome {
                    response: "late".to_string(),
                    awaiting_input: false,
                    input_type: None,
                },
                calls: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl Pipeline for MockPipeline {
        async fn process(
            &self,
            task_id: Uuid,
            _user_input: &str,
        ) -> std::result::Result<ProcessOutcome, PipelineError> {
            self.calls.lock().unwrap().push(task_id);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.outcome.clone())
        }
    }

    struct NullNotifier;

    #[async_trait::async_trait]
    impl NotificationSink for NullNotifier {
        async fn notify(
            &self,
            _webhook_url: &str,
            _task_id: Uuid,
            _response: &str,
        ) -> std::result::Result<(), PipelineError> {
            Ok(())
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            awaiting_timeout_minutes: 1440,
            task_execution_timeout: Duration::from_secs(5),
            lock_wait: Duration::from_millis(100),
            session_retention_days: 7,
        }
    }

    async fn setup(pipeline: Arc<MockPipeline>, config: WorkerConfig) -> (Arc<TaskService>, Arc<WorkerLoop>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let service = Arc::new(TaskService::new(store, &config));
        let worker = WorkerLoop::new(
            Arc::clone(&service),
            pipeline,
            Arc::new(NullNotifier),
            config,
        );
        (service, worker)
    }

    fn request(chat_id: &str) -> NewTask {
        NewTask {
            chat_id: chat_id.to_string(),
            source: "telegram".to_string(),
            user_input: "update copy".to_string(),
            dry_run: false,
            webhook_url: None,
        }
    }

    /// Insert an awaiting active task directly so `created_at` is the
    /// given timestamp. Going through `create_task` and re-upserting
    /// would not work: `created_at` is immutable on conflict.
    async fn seed_awaiting_task(
        service: &TaskService,
        chat_id: &str,
        created_at: chrono::DateTime<Utc>,
    ) -> Uuid {
        let mut task = Task::new(chat_id, "telegram", "update copy", TaskStatus::Planning);
        task.awaiting_response = true;
        task.awaiting_type = Some("approval".to_string());
        task.created_at = created_at;
        service.store().upsert_task(&task).await.unwrap();

        let now = Utc::now();
        service
            .store()
            .upsert_session(&Session {
                chat_id: chat_id.to_string(),
                source: "telegram".to_string(),
                active_task_id: Some(task.task_id),
                task_queue: vec![],
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        task.task_id
    }

    async fn wait_for<F>(mut check: F)
    where
        F: AsyncFnMut() -> bool,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn sweep_dispatches_active_task_to_completion() {
        let pipeline = MockPipeline::instant("done");
        let (service, worker) = setup(Arc::clone(&pipeline), worker_config()).await;
        let created = service.create_task(request("chat-1")).await.unwrap();

        worker.sweep_all(1).await.unwrap();
        let svc = Arc::clone(&service);
        wait_for(async || {
            svc.get_task_view(created.task_id).await.unwrap().status == "completed"
        })
        .await;
        assert_eq!(pipeline.call_count(), 1);
    }

    #[tokio::test]
    async fn sweep_does_not_dispatch_running_task_twice() {
        let pipeline = MockPipeline::slow(Duration::from_millis(200));
        let (service, worker) = setup(Arc::clone(&pipeline), worker_config()).await;
        service.create_task(request("chat-1")).await.unwrap();

        worker.sweep_all(1).await.unwrap();
        worker.sweep_all(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipeline.call_count(), 1);
    }

    #[tokio::test]
    async fn timed_out_execution_fails_task_and_advances() {
        let pipeline = MockPipeline::slow(Duration::from_secs(60));
        let mut config = worker_config();
        config.task_execution_timeout = Duration::from_millis(20);
        let (service, worker) = setup(pipeline, config).await;
        let first = service.create_task(request("chat-1")).await.unwrap();
        let second = service.create_task(request("chat-1")).await.unwrap();

        worker.sweep_all(1).await.unwrap();
        let svc = Arc::clone(&service);
        wait_for(async || {
            svc.get_task_view(first.task_id).await.unwrap().status == "error"
        })
        .await;

        let failed = service.store().get_task(first.task_id).await.unwrap().unwrap();
        assert!(failed.errors[0].message.starts_with("worker_timeout: timed out after"));

        // The queued task was promoted when the first one failed.
        let next = service.get_task_view(second.task_id).await.unwrap();
        assert_eq!(next.position_in_queue, 0);
        assert_eq!(next.detailed_status, "planning");
    }

    #[tokio::test]
    async fn terminal_active_pointer_is_recovered() {
        let pipeline = MockPipeline::instant("done");
        let (service, worker) = setup(Arc::clone(&pipeline), worker_config()).await;
        let first = service.create_task(request("chat-1")).await.unwrap();
        let second = service.create_task(request("chat-1")).await.unwrap();

        // Simulate a lost completion signal: the task row went terminal
        // but the session pointer never moved.
        let mut task = service.store().get_task(first.task_id).await.unwrap().unwrap();
        task.status = TaskStatus::Completed;
        service.store().upsert_task(&task).await.unwrap();

        worker.sweep_session("chat-1", "telegram").await.unwrap();
        let svc = Arc::clone(&service);
        wait_for(async || {
            svc.get_task_view(second.task_id).await.unwrap().status == "completed"
        })
        .await;
    }

    #[tokio::test]
    async fn awaiting_timeout_fails_stale_task() {
        let pipeline = MockPipeline::instant("done");
        let mut config = worker_config();
        config.awaiting_timeout_minutes = 60;
        let (service, worker) = setup(pipeline, config).await;

        let stale_since = Utc::now() - chrono::Duration::minutes(90);
        let task_id = seed_awaiting_task(&service, "chat-1", stale_since).await;

        // The seeded age must survive the store, or the sweep below
        // passes without exercising the threshold at all.
        let seeded = service.store().get_task(task_id).await.unwrap().unwrap();
        assert!(seeded.age_minutes(Utc::now()) >= 89);

        worker.sweep_session("chat-1", "telegram").await.unwrap();

        let swept = service.store().get_task(task_id).await.unwrap().unwrap();
        assert_eq!(swept.status, TaskStatus::Failed);
        assert!(swept.errors[0].message.starts_with("awaiting_timeout"));
    }

    #[tokio::test]
    async fn awaiting_timeout_zero_disables_sweep() {
        let pipeline = MockPipeline::instant("done");
        let mut config = worker_config();
        config.awaiting_timeout_minutes = 0;
        let (service, worker) = setup(pipeline, config).await;

        let task_id =
            seed_awaiting_task(&service, "chat-1", Utc::now() - chrono::Duration::days(30)).await;

        worker.sweep_session("chat-1", "telegram").await.unwrap();

        let after = service.store().get_task(task_id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Planning);
        assert!(after.awaiting_response);
    }

    #[tokio::test]
    async fn future_created_at_is_not_swept() {
        let pipeline = MockPipeline::instant("done");
        let mut config = worker_config();
        config.awaiting_timeout_minutes = 60;
        let (service, worker) = setup(pipeline, config).await;

        // Clock skew: created_at sits in the future. Age clamps to 0.
        let task_id =
            seed_awaiting_task(&service, "chat-1", Utc::now() + chrono::Duration::minutes(500))
                .await;

        worker.sweep_session("chat-1", "telegram").await.unwrap();

        let after = service.store().get_task(task_id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Planning);
        assert!(after.awaiting_response);
    }

    #[tokio::test]
    async fn claimed_task_is_not_redispatched_by_sweep() {
        let pipeline = MockPipeline::instant("done");
        let (service, worker) = setup(Arc::clone(&pipeline), worker_config()).await;
        let created = service.create_task(request("chat-1")).await.unwrap();

        // The synchronous input path holds the slot while it runs.
        let slot = service.try_begin_execution(created.task_id).unwrap();
        worker.sweep_all(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipeline.call_count(), 0);

        drop(slot);
        worker.sweep_all(2).await.unwrap();
        let svc = Arc::clone(&service);
        let task_id = created.task_id;
        wait_for(async || svc.get_task_view(task_id).await.unwrap().status == "completed").await;
        assert_eq!(pipeline.call_count(), 1);
    }

    #[tokio::test]
    async fn sweep_does_not_rewrite_settled_session() {
        let pipeline = MockPipeline::instant("done");
        let (service, worker) = setup(Arc::clone(&pipeline), worker_config()).await;

        let mut task = Task::new("chat-1", "telegram", "update copy", TaskStatus::Completed);
        task.completed_at = Some(Utc::now());
        service.store().upsert_task(&task).await.unwrap();
        let now = Utc::now();
        service
            .store()
            .upsert_session(&Session {
                chat_id: "chat-1".to_string(),
                source: "telegram".to_string(),
                active_task_id: None,
                task_queue: vec![],
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let before = service.store().get_session("chat-1", "telegram").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.sweep_session("chat-1", "telegram").await.unwrap();

        // Nothing to repair or dispatch, so the row must not be
        // rewritten and the session keeps aging toward retention.
        let after = service.store().get_session("chat-1", "telegram").await.unwrap().unwrap();
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(pipeline.call_count(), 0);
    }

    #[tokio::test]
    async fn locked_session_is_skipped_without_changes() {
        let pipeline = MockPipeline::instant("done");
        let (service, worker) = setup(Arc::clone(&pipeline), worker_config()).await;
        let created = service.create_task(request("chat-1")).await.unwrap();

        let _held = service.lock_session("chat-1", "telegram").await.unwrap();
        let result = worker.sweep_session("chat-1", "telegram").await;
        assert!(matches!(result, Err(Error::Lock(_))));
        // sweep_all treats the busy session as a skip, not a failure.
        worker.sweep_all(1).await.unwrap();

        assert_eq!(pipeline.call_count(), 0);
        let view = service.get_task_view(created.task_id).await.unwrap();
        assert_eq!(view.detailed_status, "planning");
    }

    #[tokio::test]
    async fn spawn_disabled_by_zero_interval() {
        let pipeline = MockPipeline::instant("done");
        let mut config = worker_config();
        config.poll_interval = Duration::ZERO;
        let (_service, worker) = setup(pipeline, config).await;
        assert!(worker.spawn().is_none());
    }
}
