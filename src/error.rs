//! Error types for Site Assist.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Session lock acquisition errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    // The session source cannot be named `source` here; thiserror
    // reserves that field name for the error cause.
    #[error("Session {chat_id}/{source_name} is busy, gave up after {waited:?}")]
    Busy {
        chat_id: String,
        source_name: String,
        waited: Duration,
    },
}

/// Queue and session-state consistency errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Task {id} is already in the queue")]
    DuplicateTask { id: Uuid },

    #[error("Active task {id} found in the queue for session {chat_id}/{source_name}")]
    ActiveTaskInQueue {
        id: Uuid,
        chat_id: String,
        source_name: String,
    },

    #[error("Task {id} is queued, not active")]
    TaskNotActive { id: Uuid },
}

/// Errors from the external processing pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Processor request failed: {0}")]
    Request(String),

    #[error("Invalid processor response: {0}")]
    InvalidResponse(String),

    #[error("Notification delivery failed: {0}")]
    Notify(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
