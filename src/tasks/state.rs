//! Task lifecycle state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted and waiting in the admission queue.
    Queued,
    /// Picked up by the worker; the executor is running.
    Running,
    /// Executor returned a result.
    Completed,
    /// Executor failed, or the task was lost to a restart.
    Failed,
    /// Executor exceeded the task's timeout.
    TimedOut,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::TimedOut,
    ];

    /// Transitions the worker may drive.
    ///
    /// Crash recovery is the only other writer and forces `Queued`/`Running`
    /// straight to `Failed`; see [`TaskStatus::is_recoverable`].
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Queued, Running) | (Running, Completed) | (Running, Failed) | (Running, TimedOut)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// States the startup reconciliation pass moves to `Failed`.
    pub fn is_recoverable(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            // Older records and the original API used the short spelling.
            "timed_out" | "timeout" => Ok(Self::TimedOut),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One atomic change applied to a stored task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    /// `queued` → `running`, stamps `started_at`.
    MarkRunning { at: DateTime<Utc> },
    /// `running` → `completed` with the executor's result.
    MarkCompleted { result: String, at: DateTime<Utc> },
    /// `running` → `failed` with a failure description.
    MarkFailed { reason: String, at: DateTime<Utc> },
    /// `running` → `timed_out` with a failure description.
    MarkTimedOut { reason: String, at: DateTime<Utc> },
    /// Bookkeeping after a webhook attempt; only valid on terminal tasks.
    RecordCallbackAttempt { attempts: u32, error: Option<String> },
}

impl TaskTransition {
    /// Status the task ends up in, if the transition changes it.
    pub fn target(&self) -> Option<TaskStatus> {
        match self {
            Self::MarkRunning { .. } => Some(TaskStatus::Running),
            Self::MarkCompleted { .. } => Some(TaskStatus::Completed),
            Self::MarkFailed { .. } => Some(TaskStatus::Failed),
            Self::MarkTimedOut { .. } => Some(TaskStatus::TimedOut),
            Self::RecordCallbackAttempt { .. } => None,
        }
    }

    /// Short name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MarkRunning { .. } => "running",
            Self::MarkCompleted { .. } => "completed",
            Self::MarkFailed { .. } => "failed",
            Self::MarkTimedOut { .. } => "timed_out",
            Self::RecordCallbackAttempt { .. } => "callback_attempt",
        }
    }

    /// Whether a task currently in `from` accepts this transition.
    pub fn is_allowed_from(&self, from: TaskStatus) -> bool {
        match self.target() {
            Some(target) => from.can_transition_to(target),
            None => from.is_terminal(),
        }
    }
}
