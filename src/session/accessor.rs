//! Load and persist session aggregates.
//!
//! The store rows are the single source of truth. `load` rebuilds the
//! aggregate from scratch on every call; nothing session-shaped is ever
//! cached across lock boundaries.

use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::session::model::{Session, SessionState};
use crate::store::traits::Store;

pub struct SessionAccessor {
    store: Arc<dyn Store>,
}

impl SessionAccessor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Rebuild the session aggregate from the store. Returns an empty
    /// state for a `(chat_id, source)` pair that has never been seen;
    /// reads never create rows.
    ///
    /// Structural invariants are checked here, so repairable damage
    /// (ghost active pointer, orphan queue ids) is fixed before any
    /// caller sees the state.
    pub async fn load(&self, chat_id: &str, source: &str) -> Result<SessionState> {
        let mut state = SessionState::new(chat_id, source);

        let Some(session) = self.store.get_session(chat_id, source).await? else {
            return Ok(state);
        };

        for task in self.store.get_tasks_for_session(chat_id, source).await? {
            state.tasks.insert(task.task_id, task);
        }
        state.active_task_id = session.active_task_id;
        state.task_queue = session.task_queue;

        state.validate()?;
        Ok(state)
    }

    /// Persist the aggregate. Task rows are written before the session
    /// pointer row, so a crash mid-save can leave at most an extra task
    /// row, never an active pointer at a missing task.
    pub async fn save(&self, state: &mut SessionState) -> Result<()> {
        state.validate()?;

        for task in state.tasks.values() {
            self.store.upsert_task(task).await?;
        }

        let now = Utc::now();
        let session = Session {
            chat_id: state.chat_id.clone(),
            source: state.source.clone(),
            active_task_id: state.active_task_id,
            task_queue: state.task_queue.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_session(&session).await?;
        Ok(())
    }
}
