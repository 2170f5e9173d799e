//! Task model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a change-request task.
///
/// The happy path is linear: `Queued` → `Planning` → `ReadingFiles` →
/// `GeneratingCode` → `DiffReady` → `Approved` → `WritingFiles` →
/// `Completed`. `Planning` and `DiffReady` are the two points where a
/// task may pause for user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in a session queue, not yet started.
    Queued,
    /// Pipeline is analyzing the request and drafting a plan.
    Planning,
    /// Pipeline is reading target files.
    ReadingFiles,
    /// Pipeline is producing changes.
    GeneratingCode,
    /// Diff is ready and waiting for approval.
    DiffReady,
    /// User approved the diff.
    Approved,
    /// Approved changes are being written out.
    WritingFiles,
    /// Task finished successfully.
    Completed,
    /// Task failed and will not continue.
    Failed,
    /// Applied changes were reverted.
    RolledBack,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// The pipeline reports progress coarsely, so any forward move
    /// along the happy path is legal (a run may jump straight from
    /// `Planning` to `Completed`); moving backward never is. Any
    /// non-terminal status may fail, and written work may be rolled
    /// back.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        if target == Failed {
            return !self.is_terminal();
        }
        if matches!(
            (self, target),
            (WritingFiles, RolledBack) | (Completed, RolledBack)
        ) {
            return true;
        }
        match (self.pipeline_step(), target.pipeline_step()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }

    /// Position along the happy path, `None` for the failure exits.
    fn pipeline_step(&self) -> Option<u8> {
        match self {
            Self::Queued => Some(0),
            Self::Planning => Some(1),
            Self::ReadingFiles => Some(2),
            Self::GeneratingCode => Some(3),
            Self::DiffReady => Some(4),
            Self::Approved => Some(5),
            Self::WritingFiles => Some(6),
            Self::Completed => Some(7),
            Self::Failed | Self::RolledBack => None,
        }
    }

    /// Check if this is a terminal status. Terminal statuses are never
    /// overwritten.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Statuses where a task may legitimately pause for user input.
    pub fn can_await_input(&self) -> bool {
        matches!(self, Self::Planning | Self::DiffReady)
    }

    /// Coarse status reported on the worker API.
    pub fn api_status(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::DiffReady => "diff_ready",
            Self::Completed => "completed",
            Self::Failed | Self::RolledBack => "error",
            _ => "in_progress",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::ReadingFiles => "reading_files",
            Self::GeneratingCode => "generating_code",
            Self::DiffReady => "diff_ready",
            Self::Approved => "approved",
            Self::WritingFiles => "writing_files",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "planning" => Ok(Self::Planning),
            "reading_files" => Ok(Self::ReadingFiles),
            "generating_code" => Ok(Self::GeneratingCode),
            "diff_ready" => Ok(Self::DiffReady),
            "approved" => Ok(Self::Approved),
            "writing_files" => Ok(Self::WritingFiles),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One entry in a task's append-only error trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A single change-request task.
///
/// Tasks are owned by exactly one `(chat_id, source)` session. The plan,
/// diffs and written-files payloads are opaque to this crate; the
/// external pipeline writes them and readers pass them through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub chat_id: String,
    pub source: String,
    pub status: TaskStatus,
    pub user_input: String,
    pub dry_run: bool,
    pub webhook_url: Option<String>,
    pub plan: Option<serde_json::Value>,
    pub diffs: Option<serde_json::Value>,
    pub written_files: Option<serde_json::Value>,
    pub last_response: Option<String>,
    pub errors: Vec<TaskError>,
    pub retry_count: u32,
    /// True while the task is paused waiting for user input.
    pub awaiting_response: bool,
    /// Kind of input expected, e.g. "approval" or "answer".
    pub awaiting_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new task in the given status.
    pub fn new(
        chat_id: impl Into<String>,
        source: impl Into<String>,
        user_input: impl Into<String>,
        status: TaskStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            source: source.into(),
            status,
            user_input: user_input.into(),
            dry_run: false,
            webhook_url: None,
            plan: None,
            diffs: None,
            written_files: None,
            last_response: None,
            errors: Vec::new(),
            retry_count: 0,
            awaiting_response: false,
            awaiting_type: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Append an error record and bump `updated_at`.
    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(TaskError {
            timestamp: Utc::now(),
            message: message.into(),
        });
        self.updated_at = Utc::now();
    }

    /// Age of the task in whole minutes, measured from `created_at` with
    /// `updated_at` as fallback. Clock skew can make the difference
    /// negative; clamp to zero so a skewed row is never treated as stale.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        let reference = if self.created_at > DateTime::<Utc>::MIN_UTC {
            self.created_at
        } else {
            self.updated_at
        };
        now.signed_duration_since(reference).num_minutes().max(0)
    }
}
