//! Task model, lifecycle transitions, and the locked task service.

pub mod lifecycle;
pub mod model;
pub mod service;

pub use model::{Task, TaskError, TaskStatus};
pub use service::{CleanupReport, CreatedTask, NewTask, TaskService, TaskView};
