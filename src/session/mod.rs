//! Session state — the per-(chat_id, source) aggregate, its accessor,
//! and per-session locking.

pub mod accessor;
pub mod lock;
pub mod model;

pub use accessor::SessionAccessor;
pub use lock::{SessionGuard, SessionLocks};
pub use model::{Session, SessionState};
