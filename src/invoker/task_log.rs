//! Per-task logger.
//!
//! One call to [`TaskLogger::log`] fans a line out to every sink the task has:
//! tracing, the durable log file (once attached), the live log channel, the
//! embedded entry list, and the broker's progress record. Progress carries
//! only a recent window of entries, so each update stays the same size.
//!
//! File writes use synchronous `std::fs` with no buffering: the tool's stdout
//! is appended to the same file, so every line must hit the file before the
//! tool is spawned.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ToolInvocationError;
use crate::logstream::{LogChannel, LogEntry, LogLevel};
use crate::queue::{Broker, PROGRESS_LOG_WINDOW, Progress, TaskHandle};

const OPEN_ATTEMPTS: u32 = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct TaskLogger {
    label: String,
    file: Option<File>,
    path: Option<PathBuf>,
    live: Option<(LogChannel, TaskHandle)>,
    progress: Option<(Broker, TaskHandle)>,
    status: String,
    entries: Vec<LogEntry>,
}

impl TaskLogger {
    /// Logger with no sinks besides tracing and the entry list. `label`
    /// identifies the task in tracing output.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            file: None,
            path: None,
            live: None,
            progress: None,
            status: String::new(),
            entries: Vec::new(),
        }
    }

    /// Also append every entry to the live channel of `handle`.
    pub fn with_live(mut self, channel: LogChannel, handle: TaskHandle) -> Self {
        self.live = Some((channel, handle));
        self
    }

    /// Also publish status and entries as broker progress for `handle`.
    pub fn with_progress(mut self, broker: Broker, handle: TaskHandle) -> Self {
        self.progress = Some((broker, handle));
        self
    }

    /// Open the durable log file in append mode, retrying briefly before
    /// giving up.
    pub async fn attach_file(&mut self, path: &Path) -> Result<(), ToolInvocationError> {
        let mut attempt = 1;
        let file = loop {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => break file,
                Err(source) if attempt >= OPEN_ATTEMPTS => {
                    return Err(ToolInvocationError::LogFileOpen {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    tracing::debug!(task = %self.label, attempt, error = %e, "Log file open failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(OPEN_RETRY_DELAY).await;
                }
            }
        };
        self.file = Some(file);
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    /// Close the durable log file. The path stays known.
    pub fn detach_file(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }

    /// Path of the durable log file, once one has been attached.
    pub fn log_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// A second handle on the durable log for the tool's stdout, and the
    /// current end offset so the tool's bytes can be read back afterwards.
    pub(crate) fn tool_stdout(&mut self) -> Result<(File, u64), ToolInvocationError> {
        let Some(file) = self.file.as_mut() else {
            return Err(ToolInvocationError::Io(std::io::Error::other(
                "durable log file is not open",
            )));
        };
        file.flush()?;
        let offset = file.metadata()?.len();
        Ok((file.try_clone()?, offset))
    }

    /// Everything written to the durable log after `offset`.
    pub(crate) fn read_since(&self, offset: u64) -> Result<String, ToolInvocationError> {
        let Some(path) = &self.path else {
            return Ok(String::new());
        };
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
        self.publish_progress().await;
    }

    pub async fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await;
    }

    pub async fn warn(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message).await;
    }

    pub async fn error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await;
    }

    pub async fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        match level {
            LogLevel::Error => tracing::error!(task = %self.label, "{}", entry.message),
            LogLevel::Warning => tracing::warn!(task = %self.label, "{}", entry.message),
            LogLevel::Info => tracing::info!(task = %self.label, "{}", entry.message),
            LogLevel::Debug => tracing::debug!(task = %self.label, "{}", entry.message),
        }

        if let Some(file) = self.file.as_mut() {
            let line = format!(
                "{} - {} - {}\n",
                entry.timestamp,
                entry.level.as_str(),
                entry.message
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!(task = %self.label, error = %e, "Durable log write failed");
            }
        }

        if let Some((channel, handle)) = &self.live {
            channel.append(handle, &entry).await;
        }

        self.entries.push(entry);
        self.publish_progress().await;
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn take_entries(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.entries)
    }

    async fn publish_progress(&self) {
        let Some((broker, handle)) = &self.progress else {
            return;
        };
        let recent = self.entries.len().saturating_sub(PROGRESS_LOG_WINDOW);
        let progress = Progress {
            status: self.status.clone(),
            log_count: self.entries.len(),
            logs: self.entries[recent..].to_vec(),
        };
        if let Err(e) = broker.set_progress(handle, &progress).await {
            tracing::warn!(task = %self.label, error = %e, "Progress update failed");
        }
    }
}

impl Drop for TaskLogger {
    fn drop(&mut self) {
        self.detach_file();
    }
}

/// Create `dir` (and parents) for a durable log.
pub(crate) fn ensure_log_dir(dir: &Path) -> Result<(), ToolInvocationError> {
    fs::create_dir_all(dir)?;
    Ok(())
}
