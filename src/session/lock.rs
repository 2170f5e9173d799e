//! Per-session locking.
//!
//! Every read-modify-write of a session's state must run under that
//! session's lock. Acquisition is bounded: callers that cannot get the
//! lock in time get a `LockError` instead of piling up behind a slow
//! pipeline run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::error::LockError;

/// Registry of per-`(chat_id, source)` locks.
#[derive(Default)]
pub struct SessionLocks {
    locks: RwLock<HashMap<(String, String), Arc<Mutex<()>>>>,
}

/// A held session lock. Released on drop.
pub struct SessionGuard {
    _guard: OwnedMutexGuard<()>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a session, waiting at most `wait`.
    pub async fn acquire(
        &self,
        chat_id: &str,
        source: &str,
        wait: Duration,
    ) -> Result<SessionGuard, LockError> {
        let lock = {
            let key = (chat_id.to_string(), source.to_string());
            let mut locks = self.locks.write().await;
            Arc::clone(locks.entry(key).or_default())
        };

        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => {
                debug!(%chat_id, %source, "session lock acquired");
                Ok(SessionGuard { _guard: guard })
            }
            Err(_) => Err(LockError::Busy {
                chat_id: chat_id.to_string(),
                source_name: source.to_string(),
                waited: wait,
            }),
        }
    }
}
