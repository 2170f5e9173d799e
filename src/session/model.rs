//! Session rows and the in-memory session aggregate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::QueueError;
use crate::task::model::Task;

/// A session row as persisted: one per `(chat_id, source)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub chat_id: String,
    pub source: String,
    pub active_task_id: Option<Uuid>,
    pub task_queue: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The full state of one session, reconstructed from the store on every
/// load. The store rows are the source of truth; this aggregate exists
/// only for the duration of a locked read-modify-write.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub chat_id: String,
    pub source: String,
    pub tasks: HashMap<Uuid, Task>,
    pub active_task_id: Option<Uuid>,
    /// Queued task ids, oldest first. Never contains the active id.
    pub task_queue: Vec<Uuid>,
}

impl SessionState {
    pub fn new(chat_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The currently active task, if the pointer resolves.
    pub fn active_task(&self) -> Option<&Task> {
        self.active_task_id.and_then(|id| self.tasks.get(&id))
    }

    /// Validate structural invariants, repairing what can be repaired
    /// without guessing.
    ///
    /// A ghost active pointer or an orphan queue entry has exactly one
    /// sane fix (drop it), so those are repaired with a warning. An
    /// active id that also sits in the queue is ambiguous and means a
    /// bug elsewhere; that one is a hard error.
    pub fn validate(&mut self) -> Result<(), QueueError> {
        if let Some(active) = self.active_task_id {
            if !self.tasks.contains_key(&active) {
                warn!(
                    chat_id = %self.chat_id,
                    source = %self.source,
                    task_id = %active,
                    "clearing active task pointer with no backing task"
                );
                self.active_task_id = None;
            }
        }

        let before = self.task_queue.len();
        self.task_queue.retain(|id| self.tasks.contains_key(id));
        if self.task_queue.len() < before {
            warn!(
                chat_id = %self.chat_id,
                source = %self.source,
                removed = before - self.task_queue.len(),
                "removed queue entries with no backing task"
            );
        }

        if let Some(active) = self.active_task_id {
            if self.task_queue.contains(&active) {
                return Err(QueueError::ActiveTaskInQueue {
                    id: active,
                    chat_id: self.chat_id.clone(),
                    source_name: self.source.clone(),
                });
            }
        }

        Ok(())
    }
}
