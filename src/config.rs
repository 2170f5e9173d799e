//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the libSQL database file.
    pub db_path: String,
    /// HTTP listen port for the worker API.
    pub http_port: u16,
    /// Bearer token for the worker API. Unset disables auth (dev only).
    pub api_token: Option<SecretString>,
    /// Base URL of the external processing pipeline.
    pub pipeline_url: String,
    pub worker: WorkerConfig,
}

/// Background worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sweep interval. Zero disables the loop entirely.
    pub poll_interval: Duration,
    /// Minutes a task may sit awaiting a user response before it is
    /// failed and the queue advances. Zero disables the timeout.
    pub awaiting_timeout_minutes: i64,
    /// Hard cap on a single background pipeline run.
    pub task_execution_timeout: Duration,
    /// How long to wait for a session lock before giving up.
    pub lock_wait: Duration,
    /// Sessions untouched for this many days are deleted at startup.
    pub session_retention_days: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "site_assist.db".to_string(),
            http_port: 8081,
            api_token: None,
            pipeline_url: "http://127.0.0.1:8090".to_string(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            awaiting_timeout_minutes: 1440, // 24 hours
            task_execution_timeout: Duration::from_secs(600),
            lock_wait: Duration::from_secs(10),
            session_retention_days: 7,
        }
    }
}

impl AppConfig {
    /// Build configuration from `SITE_ASSIST_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("SITE_ASSIST_DB_PATH").unwrap_or(defaults.db_path),
            http_port: std::env::var("SITE_ASSIST_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_port),
            api_token: std::env::var("SITE_ASSIST_API_TOKEN")
                .ok()
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            pipeline_url: std::env::var("SITE_ASSIST_PIPELINE_URL").unwrap_or(defaults.pipeline_url),
            worker: WorkerConfig {
                poll_interval: std::env::var("SITE_ASSIST_POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.worker.poll_interval),
                awaiting_timeout_minutes: std::env::var("SITE_ASSIST_AWAITING_TIMEOUT_MINUTES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.worker.awaiting_timeout_minutes),
                task_execution_timeout: std::env::var("SITE_ASSIST_TASK_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.worker.task_execution_timeout),
                lock_wait: std::env::var("SITE_ASSIST_LOCK_WAIT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.worker.lock_wait),
                session_retention_days: std::env::var("SITE_ASSIST_SESSION_RETENTION_DAYS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.worker.session_retention_days),
            },
        }
    }
}
