//! Pure queue and lifecycle transitions on a session aggregate.
//!
//! These functions mutate a loaded `SessionState` and do no IO; callers
//! hold the session lock and persist the result. Keeping them pure lets
//! the API service and the background worker share one set of rules.

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::QueueError;
use crate::session::model::SessionState;
use crate::task::model::{Task, TaskStatus};

/// Make a task the session's active task immediately, bypassing the
/// queue. Only valid when the session has no usable active task; the
/// first request of an idle session starts without a queue round-trip.
pub fn activate_first(state: &mut SessionState, mut task: Task) -> Uuid {
    debug_assert!(!has_active_work(state));
    task.status = TaskStatus::Planning;
    task.updated_at = Utc::now();
    let id = task.task_id;
    state.tasks.insert(id, task);
    state.active_task_id = Some(id);
    id
}

/// Append a task to the session queue. Returns its 1-based position.
pub fn enqueue(state: &mut SessionState, mut task: Task) -> Result<usize, QueueError> {
    let id = task.task_id;
    if state.task_queue.contains(&id) || state.tasks.contains_key(&id) {
        return Err(QueueError::DuplicateTask { id });
    }
    task.status = TaskStatus::Queued;
    task.updated_at = Utc::now();
    state.tasks.insert(id, task);
    state.task_queue.push(id);
    Ok(state.task_queue.len())
}

/// True when the session has an active task that is still running.
pub fn has_active_work(state: &SessionState) -> bool {
    state
        .active_task()
        .is_some_and(|task| !task.status.is_terminal())
}

/// Finalize the active task and advance the queue.
///
/// No-ops (returning `None`) when `task_id` is not the active task, so a
/// duplicate completion signal for an already-advanced task is harmless.
/// Returns the id of the newly promoted task, if any.
pub fn finalize_active(
    state: &mut SessionState,
    task_id: Uuid,
    final_status: TaskStatus,
) -> Option<Uuid> {
    if state.active_task_id != Some(task_id) {
        warn!(
            chat_id = %state.chat_id,
            source = %state.source,
            %task_id,
            "ignoring completion for a task that is not active"
        );
        return None;
    }

    if let Some(task) = state.tasks.get_mut(&task_id) {
        if apply_status(task, final_status) {
            task.completed_at = Some(Utc::now());
        }
    }

    state.active_task_id = None;
    promote_next(state)
}

/// Promote the queue head to active when no active task is set. Returns
/// the promoted id, if the queue had one.
pub fn promote_next(state: &mut SessionState) -> Option<Uuid> {
    if state.active_task_id.is_some() {
        return None;
    }
    while !state.task_queue.is_empty() {
        let id = state.task_queue.remove(0);
        match state.tasks.get_mut(&id) {
            Some(task) => {
                task.status = TaskStatus::Planning;
                task.updated_at = Utc::now();
                state.active_task_id = Some(id);
                return Some(id);
            }
            None => {
                warn!(%id, "skipping queued id with no backing task");
            }
        }
    }
    None
}

/// Apply a status change, enforcing the transition table: terminal
/// statuses are never replaced and the pipeline only moves forward.
/// Reapplying the current status is a harmless no-op. Returns whether
/// the task now carries `new_status`.
pub fn apply_status(task: &mut Task, new_status: TaskStatus) -> bool {
    if task.status == new_status {
        return true;
    }
    if !task.status.can_transition_to(new_status) {
        warn!(
            task_id = %task.task_id,
            current = %task.status,
            rejected = %new_status,
            "refusing illegal status transition"
        );
        return false;
    }
    task.status = new_status;
    task.updated_at = Utc::now();
    if new_status.is_terminal() && task.completed_at.is_none() {
        task.completed_at = Some(Utc::now());
    }
    true
}

/// Pause the task for user input. Only meaningful at the pause points.
pub fn set_awaiting(task: &mut Task, awaiting: bool, input_type: Option<String>) {
    task.awaiting_response = awaiting;
    task.awaiting_type = if awaiting { input_type } else { None };
    task.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(input: &str) -> Task {
        Task::new("chat-1", "telegram", input, TaskStatus::Queued)
    }

    fn idle_session() -> SessionState {
        SessionState::new("chat-1", "telegram")
    }

    #[test]
    fn first_task_bypasses_queue() {
        let mut state = idle_session();
        let id = activate_first(&mut state, task("first"));
        assert_eq!(state.active_task_id, Some(id));
        assert!(state.task_queue.is_empty());
        assert_eq!(state.tasks[&id].status, TaskStatus::Planning);
    }

    #[test]
    fn enqueue_is_fifo_with_one_based_positions() {
        let mut state = idle_session();
        activate_first(&mut state, task("active"));
        let a = task("a");
        let b = task("b");
        let (a_id, b_id) = (a.task_id, b.task_id);
        assert_eq!(enqueue(&mut state, a).unwrap(), 1);
        assert_eq!(enqueue(&mut state, b).unwrap(), 2);
        assert_eq!(state.task_queue, vec![a_id, b_id]);
    }

    #[test]
    fn enqueue_rejects_duplicates() {
        let mut state = idle_session();
        let t = task("a");
        let dup = t.clone();
        enqueue(&mut state, t).unwrap();
        assert!(matches!(
            enqueue(&mut state, dup),
            Err(QueueError::DuplicateTask { .. })
        ));
    }

    #[test]
    fn finalize_promotes_queue_head_in_order() {
        let mut state = idle_session();
        let first = activate_first(&mut state, task("first"));
        let a = task("a");
        let b = task("b");
        let (a_id, b_id) = (a.task_id, b.task_id);
        enqueue(&mut state, a).unwrap();
        enqueue(&mut state, b).unwrap();

        let promoted = finalize_active(&mut state, first, TaskStatus::Completed);
        assert_eq!(promoted, Some(a_id));
        assert_eq!(state.active_task_id, Some(a_id));
        assert_eq!(state.task_queue, vec![b_id]);
        assert_eq!(state.tasks[&first].status, TaskStatus::Completed);
        assert!(state.tasks[&first].completed_at.is_some());
        assert_eq!(state.tasks[&a_id].status, TaskStatus::Planning);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut state = idle_session();
        let first = activate_first(&mut state, task("first"));
        finalize_active(&mut state, first, TaskStatus::Completed);
        // Second signal for the same task changes nothing.
        let promoted = finalize_active(&mut state, first, TaskStatus::Failed);
        assert_eq!(promoted, None);
        assert_eq!(state.tasks[&first].status, TaskStatus::Completed);
        assert!(state.active_task_id.is_none());
    }

    #[test]
    fn finalize_ignores_non_active_task() {
        let mut state = idle_session();
        let active = activate_first(&mut state, task("active"));
        let queued = task("queued");
        let queued_id = queued.task_id;
        enqueue(&mut state, queued).unwrap();

        let promoted = finalize_active(&mut state, queued_id, TaskStatus::Completed);
        assert_eq!(promoted, None);
        assert_eq!(state.active_task_id, Some(active));
        assert_eq!(state.tasks[&queued_id].status, TaskStatus::Queued);
    }

    #[test]
    fn promote_next_fills_a_cleared_slot() {
        let mut state = idle_session();
        let a = task("a");
        let a_id = a.task_id;
        enqueue(&mut state, a).unwrap();
        // Active slot cleared out of band.
        assert_eq!(promote_next(&mut state), Some(a_id));
        assert_eq!(state.active_task_id, Some(a_id));
        assert!(state.task_queue.is_empty());
    }

    #[test]
    fn promote_next_noop_when_active_set() {
        let mut state = idle_session();
        activate_first(&mut state, task("active"));
        let a = task("a");
        enqueue(&mut state, a).unwrap();
        assert_eq!(promote_next(&mut state), None);
        assert_eq!(state.task_queue.len(), 1);
    }

    #[test]
    fn terminal_guard_rejects_downgrade() {
        let mut t = task("x");
        assert!(apply_status(&mut t, TaskStatus::Completed));
        assert!(!apply_status(&mut t, TaskStatus::Planning));
        assert_eq!(t.status, TaskStatus::Completed);
        // Re-applying the same terminal status is allowed.
        assert!(apply_status(&mut t, TaskStatus::Completed));
    }

    #[test]
    fn apply_status_rejects_backward_moves() {
        let mut t = task("x");
        t.status = TaskStatus::DiffReady;
        assert!(!apply_status(&mut t, TaskStatus::Planning));
        assert_eq!(t.status, TaskStatus::DiffReady);
        // Forward from the pause point is how approved work lands.
        assert!(apply_status(&mut t, TaskStatus::Completed));
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn has_active_work_sees_terminal_active_as_idle() {
        let mut state = idle_session();
        let id = activate_first(&mut state, task("x"));
        assert!(has_active_work(&state));
        state.tasks.get_mut(&id).unwrap().status = TaskStatus::Failed;
        assert!(!has_active_work(&state));
    }

    #[test]
    fn set_awaiting_clears_type_on_resume() {
        let mut t = task("x");
        set_awaiting(&mut t, true, Some("approval".to_string()));
        assert!(t.awaiting_response);
        assert_eq!(t.awaiting_type.as_deref(), Some("approval"));
        set_awaiting(&mut t, false, None);
        assert!(!t.awaiting_response);
        assert!(t.awaiting_type.is_none());
    }
}
