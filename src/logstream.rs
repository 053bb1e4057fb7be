//! Live per-task log channel.
//!
//! Entries are appended by workers and read by drivers from a shared SQLite
//! file. Each task handle owns an ordered, append-only list that is created
//! on first append and removed explicitly by [`LogChannel::clear`] or
//! [`LogChannel::clear_matching`].
//!
//! Appends are best-effort: a worker never fails a task because the log
//! store is unreachable. A driver that cannot connect falls back to the log
//! list embedded in the task's final result.

use std::path::Path;
use std::time::Duration;

use chrono::Local;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::queue::TaskHandle;
use crate::store::SqliteStore;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS task_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id, id);
"#;

/// Interval at which [`LogChannel::tail`] checks for new entries.
pub const TAIL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "DEBUG" => LogLevel::Debug,
            "WARNING" => LogLevel::Warning,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            level,
            message: message.into(),
        }
    }
}

/// Single-line rendering used by every command that prints log entries.
pub fn format_entry(entry: &LogEntry) -> String {
    let prefix = match entry.level {
        LogLevel::Error => "\u{2716}",   // "✖"
        LogLevel::Warning => "\u{25B2}", // "▲"
        LogLevel::Info => "\u{25CF}",    // "●"
        LogLevel::Debug => "\u{25CB}",   // "○"
    };
    format!(
        "   {prefix} [{}] {}: {}",
        entry.timestamp,
        entry.level.as_str(),
        entry.message
    )
}

#[derive(Clone)]
pub struct LogChannel {
    store: SqliteStore,
}

impl LogChannel {
    /// Open the log store, or `None` when it is unreachable.
    pub async fn connect(path: &Path) -> Option<Self> {
        match Self::open(path).await {
            Ok(channel) => Some(channel),
            Err(e) => {
                tracing::warn!(error = %e, "Log store unavailable; live log streaming disabled");
                None
            }
        }
    }

    pub async fn open(path: &Path) -> Result<Self, BrokerError> {
        Ok(Self {
            store: SqliteStore::open(path, SCHEMA).await?,
        })
    }

    /// Append one entry. Failures are logged and swallowed.
    pub async fn append(&self, handle: &TaskHandle, entry: &LogEntry) {
        let task_id = handle.to_string();
        let entry = entry.clone();
        let result = self
            .store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO task_logs (task_id, timestamp, level, message) VALUES (?1, ?2, ?3, ?4)",
                    params![task_id, entry.timestamp, entry.level.as_str(), entry.message],
                )?;
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::debug!(task = %handle, error = %e, "Dropped live log entry");
        }
    }

    /// Number of entries recorded for `handle`.
    pub async fn len(&self, handle: &TaskHandle) -> Result<usize, BrokerError> {
        let task_id = handle.to_string();
        self.store
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM task_logs WHERE task_id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await
    }

    /// Entries past the first `since`, in append order.
    pub async fn read_new(
        &self,
        handle: &TaskHandle,
        since: usize,
    ) -> Result<Vec<LogEntry>, BrokerError> {
        let task_id = handle.to_string();
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, level, message FROM task_logs
                     WHERE task_id = ?1 ORDER BY id LIMIT -1 OFFSET ?2",
                )?;
                let entries = stmt
                    .query_map(params![task_id, since as i64], |row| {
                        let level: String = row.get(1)?;
                        Ok(LogEntry {
                            timestamp: row.get(0)?,
                            level: LogLevel::parse(&level),
                            message: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await
    }

    /// Remove the channel of one task. Returns 1 if it existed.
    pub async fn clear(&self, handle: &TaskHandle) -> Result<usize, BrokerError> {
        let task_id = handle.to_string();
        self.store
            .call(move |conn| {
                let removed =
                    conn.execute("DELETE FROM task_logs WHERE task_id = ?1", params![task_id])?;
                Ok(usize::from(removed > 0))
            })
            .await
    }

    /// Remove every channel whose handle matches the glob `pattern` (`*` = all).
    /// Returns the number of channels removed.
    pub async fn clear_matching(&self, pattern: &str) -> Result<usize, BrokerError> {
        let pattern = pattern.to_string();
        self.store
            .call(move |conn| {
                let channels: i64 = conn.query_row(
                    "SELECT COUNT(DISTINCT task_id) FROM task_logs WHERE task_id GLOB ?1",
                    params![pattern],
                    |row| row.get(0),
                )?;
                conn.execute("DELETE FROM task_logs WHERE task_id GLOB ?1", params![pattern])?;
                Ok(channels as usize)
            })
            .await
    }

    /// Follow the channel of `handle`, passing each new entry to `sink` in
    /// order, until `token` is cancelled. Checks the length every `interval`
    /// and decodes only the unseen suffix. A final drain runs after
    /// cancellation so entries appended just before it are not lost.
    ///
    /// Returns the number of entries delivered.
    pub async fn tail<F>(
        &self,
        handle: &TaskHandle,
        interval: Duration,
        token: CancellationToken,
        mut sink: F,
    ) -> usize
    where
        F: FnMut(&LogEntry),
    {
        let mut seen = 0usize;
        loop {
            let stopping = token.is_cancelled();

            match self.len(handle).await {
                Ok(current) if current > seen => match self.read_new(handle, seen).await {
                    Ok(entries) => {
                        for entry in &entries {
                            sink(entry);
                        }
                        seen += entries.len();
                    }
                    Err(e) => {
                        tracing::warn!(task = %handle, error = %e, "Log tail read failed");
                        break;
                    }
                },
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task = %handle, error = %e, "Log tail stopped");
                    break;
                }
            }

            if stopping {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        seen
    }
}
