//! Shared vocabulary between the driver-side client, the broker, and workers.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bundle::TaskDescriptor;
use crate::invoker::ExecutionResult;
use crate::logstream::LogEntry;

/// Opaque reference to one submitted execution.
///
/// UUID v4 strings, assigned by the broker on submit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskHandle {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a submitted task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// Queued, not yet claimed by a worker.
    Pending,
    /// Claimed and executing.
    Progress,
    Success,
    Failure,
    /// Revoked by the cancellation controller.
    Revoked,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Progress => "PROGRESS",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Revoked => "REVOKED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PROGRESS" => TaskState::Progress,
            "SUCCESS" => TaskState::Success,
            "FAILURE" => TaskState::Failure,
            "REVOKED" => TaskState::Revoked,
            _ => TaskState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Revoked
        )
    }

    /// Operator-facing description of the state.
    pub fn describe(self) -> &'static str {
        match self {
            TaskState::Pending => "Task is waiting to be processed",
            TaskState::Progress => "Task is being processed",
            TaskState::Success => "Task completed successfully",
            TaskState::Failure => "Task failed",
            TaskState::Revoked => "Task was revoked",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker needs to execute a task: the message put on the queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmittedTask {
    pub descriptor: TaskDescriptor,
    pub database_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_rules_path: Option<PathBuf>,
}

/// Entries carried in each progress snapshot.
pub const PROGRESS_LOG_WINDOW: usize = 20;

/// Incremental progress published by the worker while a task runs.
///
/// `log_count` counts every entry so far; `logs` holds only the most recent
/// [`PROGRESS_LOG_WINDOW`] of them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub status: String,
    pub log_count: usize,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl Progress {
    /// Entries of the recent window whose position in the full log is
    /// `since` or later.
    pub fn entries_since(&self, since: usize) -> &[LogEntry] {
        let first = self.log_count.saturating_sub(self.logs.len());
        let skip = since.saturating_sub(first).min(self.logs.len());
        &self.logs[skip..]
    }
}

/// Snapshot of a task row as stored by the broker.
#[derive(Clone, Debug)]
pub struct TaskRecord {
    pub handle: TaskHandle,
    pub state: TaskState,
    pub worker: Option<String>,
    pub progress: Option<Progress>,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
}

/// Answer to a status query.
#[derive(Clone, Debug, Serialize)]
pub struct TaskStatus {
    pub task_id: TaskHandle,
    pub state: TaskState,
    pub ready: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn from_record(handle: &TaskHandle, record: Option<TaskRecord>) -> Self {
        let Some(record) = record else {
            // Unknown ids look like queued ones, as with any broker that
            // cannot distinguish "not yet seen" from "never submitted".
            return Self {
                task_id: handle.clone(),
                state: TaskState::Pending,
                ready: false,
                status: TaskState::Pending.describe().to_string(),
                progress: None,
                result: None,
                error: None,
            };
        };

        let state = record.state;
        Self {
            task_id: record.handle,
            state,
            ready: state.is_terminal(),
            status: state.describe().to_string(),
            progress: (state == TaskState::Progress)
                .then_some(record.progress)
                .flatten(),
            result: (state == TaskState::Success).then_some(record.result).flatten(),
            error: match state {
                TaskState::Failure => Some(record.error.unwrap_or_else(|| "Unknown error".into())),
                TaskState::Revoked => Some(record.error.unwrap_or_else(|| "revoked".into())),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            TaskState::Pending,
            TaskState::Progress,
            TaskState::Success,
            TaskState::Failure,
            TaskState::Revoked,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), state);
        }
        assert!(!TaskState::Progress.is_terminal());
        assert!(TaskState::Revoked.is_terminal());
    }

    #[test]
    fn progress_window_is_indexed_by_total_count() {
        let logs: Vec<LogEntry> = (0..3)
            .map(|i| LogEntry::new(crate::logstream::LogLevel::Info, format!("line {}", 7 + i)))
            .collect();
        let progress = Progress {
            status: "Running".into(),
            log_count: 10,
            logs,
        };

        assert_eq!(progress.entries_since(0).len(), 3);
        assert_eq!(progress.entries_since(8)[0].message, "line 8");
        assert!(progress.entries_since(10).is_empty());
        assert!(progress.entries_since(25).is_empty());
    }

    #[test]
    fn unknown_handle_reports_pending() {
        let handle = TaskHandle::from("nope".to_string());
        let status = TaskStatus::from_record(&handle, None);
        assert_eq!(status.state, TaskState::Pending);
        assert!(!status.ready);
        assert!(status.error.is_none());
    }

    #[test]
    fn failure_without_message_gets_placeholder() {
        let handle = TaskHandle::generate();
        let record = TaskRecord {
            handle: handle.clone(),
            state: TaskState::Failure,
            worker: Some("w1".into()),
            progress: None,
            result: None,
            error: None,
        };
        let status = TaskStatus::from_record(&handle, Some(record));
        assert!(status.ready);
        assert_eq!(status.error.as_deref(), Some("Unknown error"));
    }
}
