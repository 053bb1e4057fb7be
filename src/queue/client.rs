//! Driver-side queue client: submission, status queries, and waiting.
//!
//! The client never executes anything itself. It only writes messages to the
//! broker and polls it, so the driver can exit while tasks keep running.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::broker::Broker;
use super::types::{SubmittedTask, TaskHandle, TaskRecord, TaskState, TaskStatus};
use crate::bundle::TaskDescriptor;
use crate::config::AppConfig;
use crate::error::BrokerError;
use crate::invoker::{ExecutionResult, ExecutionStatus};
use crate::logstream::{LogChannel, LogEntry, TAIL_INTERVAL, format_entry};

/// How long the driver waits for the log tail to finish after the task settles.
const TAIL_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Display switches for [`QueueClient::wait`].
#[derive(Clone, Debug)]
pub struct WaitOptions {
    /// Label used in progress lines.
    pub description: String,
    /// Print log entries at all.
    pub show_logs: bool,
    /// Tail the live log store (when reachable) instead of progress snapshots.
    pub stream: bool,
}

/// Final state of a waited-on task.
#[derive(Clone, Debug)]
pub struct WaitOutcome {
    pub state: TaskState,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
}

impl WaitOutcome {
    /// Terminal SUCCESS whose result also reports success.
    pub fn is_success(&self) -> bool {
        self.state == TaskState::Success
            && self
                .result
                .as_ref()
                .is_some_and(|r| r.status == ExecutionStatus::Success)
    }
}

/// Explicitly constructed handle to the broker and the live log store.
#[derive(Clone)]
pub struct QueueClient {
    broker: Broker,
    logs: Option<LogChannel>,
    poll_interval: Duration,
}

impl QueueClient {
    pub fn new(broker: Broker, logs: Option<LogChannel>, poll_interval: Duration) -> Self {
        Self {
            broker,
            logs,
            poll_interval,
        }
    }

    /// Open the broker (failing loudly) and the log store (degrading to
    /// `None`) named by the configuration.
    pub async fn connect(config: &AppConfig) -> Result<Self, BrokerError> {
        let broker = Broker::open(&config.broker_path).await?;
        let logs = LogChannel::connect(&config.log_store_path).await;
        Ok(Self::new(
            broker,
            logs,
            Duration::from_secs(config.poll_interval_secs.max(1)),
        ))
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn logs(&self) -> Option<&LogChannel> {
        self.logs.as_ref()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Hand a descriptor to the broker for pickup by any worker.
    ///
    /// Relative rules paths are resolved against this process's working
    /// directory first; the worker runs elsewhere.
    pub async fn submit(
        &self,
        descriptor: &TaskDescriptor,
        database_name: &str,
        shared_rules_path: Option<&Path>,
    ) -> Result<TaskHandle, BrokerError> {
        let mut descriptor = descriptor.clone();
        if let Some(path) = &descriptor.rules_file {
            descriptor.rules_file = Some(anchor(path)?);
        }
        if let Some(rules) = &descriptor.rules {
            let named = Path::new(rules.trim());
            if named.is_relative() && named.is_file() {
                descriptor.rules = Some(anchor(named)?.to_string_lossy().into_owned());
            }
        }
        let message = SubmittedTask {
            database_name: database_name.to_string(),
            shared_rules_path: shared_rules_path.map(anchor).transpose()?,
            descriptor,
        };
        let handle = self.broker.enqueue(&message).await?;
        tracing::info!(task = %handle, task_type = %message.descriptor.task_type, "Task submitted");
        Ok(handle)
    }

    pub async fn get_status(&self, handle: &TaskHandle) -> Result<TaskStatus, BrokerError> {
        let record = self.broker.get(handle).await?;
        Ok(TaskStatus::from_record(handle, record))
    }

    /// Current record if the task has settled, `None` otherwise.
    pub async fn ready_record(&self, handle: &TaskHandle) -> Result<Option<TaskRecord>, BrokerError> {
        Ok(self
            .broker
            .get(handle)
            .await?
            .filter(|record| record.state.is_terminal()))
    }

    /// Full log of a task: the live store first, then the log list embedded
    /// in the final result. A running task without a live store only has the
    /// recent window of its progress snapshot.
    pub async fn fetch_logs(&self, handle: &TaskHandle) -> Result<Vec<LogEntry>, BrokerError> {
        if let Some(logs) = &self.logs {
            match logs.read_new(handle, 0).await {
                Ok(entries) if !entries.is_empty() => return Ok(entries),
                Ok(_) => {}
                Err(e) => tracing::warn!(task = %handle, error = %e, "Live log read failed"),
            }
        }

        let Some(record) = self.broker.get(handle).await? else {
            return Ok(Vec::new());
        };
        Ok(match record.state {
            TaskState::Progress => record.progress.map(|p| p.logs).unwrap_or_default(),
            _ => record.result.map(|r| r.logs).unwrap_or_default(),
        })
    }

    /// Poll `handle` every `poll_interval` until it settles, printing status
    /// changes and logs along the way.
    pub async fn wait(
        &self,
        handle: &TaskHandle,
        options: &WaitOptions,
    ) -> Result<WaitOutcome, BrokerError> {
        println!("Waiting for {} to complete...", options.description);
        println!("   Task ID: {handle}");

        let tail = match (&self.logs, options.show_logs && options.stream) {
            (Some(logs), true) => {
                println!("   Streaming live logs...");
                let token = CancellationToken::new();
                let logs = logs.clone();
                let tail_handle = handle.clone();
                let tail_token = token.clone();
                let join = tokio::spawn(async move {
                    logs.tail(&tail_handle, TAIL_INTERVAL, tail_token, |entry| {
                        println!("{}", format_entry(entry))
                    })
                    .await
                });
                Some((token, join))
            }
            _ => None,
        };

        let mut last_status: Option<String> = None;
        let mut printed = 0usize;
        let mut ticker = tokio::time::interval(self.poll_interval);

        let record = loop {
            ticker.tick().await;
            let Some(record) = self.broker.get(handle).await? else {
                continue;
            };
            if record.state.is_terminal() {
                break record;
            }
            if record.state != TaskState::Progress {
                continue;
            }

            let progress = record.progress.unwrap_or_default();
            let status = if progress.status.is_empty() {
                "Processing...".to_string()
            } else {
                progress.status.clone()
            };
            let current = format!("{status} ({} log entries)", progress.log_count);
            if last_status.as_deref() != Some(current.as_str()) {
                println!("   Status: {current}");
                last_status = Some(current);
            }

            if options.show_logs && tail.is_none() && progress.log_count > printed {
                for entry in progress.entries_since(printed) {
                    println!("{}", format_entry(entry));
                }
                printed = progress.log_count;
            }
        };

        let streamed = tail.is_some();
        if let Some((token, join)) = tail {
            token.cancel();
            if tokio::time::timeout(TAIL_JOIN_TIMEOUT, join).await.is_err() {
                tracing::warn!(task = %handle, "Log tail did not stop in time");
            }
        }

        let outcome = WaitOutcome {
            state: record.state,
            error: record.error.clone().or_else(|| {
                record
                    .result
                    .as_ref()
                    .and_then(|r| r.error.clone())
            }),
            result: record.result,
        };

        if outcome.is_success() {
            println!("{} completed successfully", options.description);
            if options.show_logs && !streamed {
                let logs = outcome
                    .result
                    .as_ref()
                    .map(|r| r.logs.as_slice())
                    .unwrap_or_default();
                for entry in logs.iter().skip(printed) {
                    println!("{}", format_entry(entry));
                }
            }
        } else {
            let error = outcome.error.as_deref().unwrap_or("Unknown error");
            println!("{} failed: {error}", options.description);
            if options.show_logs && !streamed {
                let logs = self.fetch_logs(handle).await?;
                if logs.len() > printed {
                    println!("Error logs:");
                    for entry in &logs[printed..] {
                        println!("{}", format_entry(entry));
                    }
                }
            }
        }

        Ok(outcome)
    }
}

fn anchor(path: &Path) -> Result<PathBuf, BrokerError> {
    std::path::absolute(path).map_err(|source| BrokerError::Path {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::OutputKind;
    use serde_json::Map;
    use tempfile::TempDir;

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor {
            task_type: "crud".into(),
            task_data: Map::new(),
            instructions: "do {name}".into(),
            rules: None,
            rules_file: None,
            task_identifier: None,
            log_folder_key: None,
        }
    }

    async fn client(tmp: &TempDir) -> QueueClient {
        let broker = Broker::open(&tmp.path().join("broker.db")).await.unwrap();
        let logs = LogChannel::connect(&tmp.path().join("logs.db")).await;
        QueueClient::new(broker, logs, Duration::from_millis(20))
    }

    fn success(logs: Vec<LogEntry>) -> ExecutionResult {
        ExecutionResult {
            status: ExecutionStatus::Success,
            task_type: "crud".into(),
            task_data: Map::new(),
            log_file: "crud.log".into(),
            error: None,
            output: OutputKind::Raw,
            written_files: vec![],
            logs,
        }
    }

    #[tokio::test]
    async fn submit_then_status_follows_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let client = client(&tmp).await;

        let handle = client.submit(&descriptor(), "db", None).await.unwrap();
        assert_eq!(client.get_status(&handle).await.unwrap().state, TaskState::Pending);

        let claimed = client.broker().claim("w").await.unwrap().unwrap();
        assert_eq!(claimed.task.database_name, "db");
        assert_eq!(client.get_status(&handle).await.unwrap().state, TaskState::Progress);

        client.broker().complete(&handle, &success(vec![])).await.unwrap();
        let status = client.get_status(&handle).await.unwrap();
        assert_eq!(status.state, TaskState::Success);
        assert!(status.ready);
        assert!(status.result.is_some());
    }

    #[tokio::test]
    async fn wait_returns_once_the_task_settles() {
        let tmp = TempDir::new().unwrap();
        let client = client(&tmp).await;
        let handle = client.submit(&descriptor(), "db", None).await.unwrap();

        let worker = {
            let client = client.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                client.broker().claim("w").await.unwrap();
                tokio::time::sleep(Duration::from_millis(60)).await;
                client.broker().fail(&handle, "tool exploded", None).await.unwrap();
            })
        };

        let options = WaitOptions {
            description: "crud".into(),
            show_logs: true,
            stream: true,
        };
        let outcome = client.wait(&handle, &options).await.unwrap();
        worker.await.unwrap();

        assert_eq!(outcome.state, TaskState::Failure);
        assert!(!outcome.is_success());
        assert_eq!(outcome.error.as_deref(), Some("tool exploded"));
    }

    #[tokio::test]
    async fn fetch_logs_falls_back_to_result() {
        let tmp = TempDir::new().unwrap();
        let broker = Broker::open(&tmp.path().join("broker.db")).await.unwrap();
        let client = QueueClient::new(broker, None, Duration::from_millis(20));

        let handle = client.submit(&descriptor(), "db", None).await.unwrap();
        client.broker().claim("w").await.unwrap();
        let embedded = vec![LogEntry::new(crate::logstream::LogLevel::Info, "from result")];
        client
            .broker()
            .complete(&handle, &success(embedded.clone()))
            .await
            .unwrap();

        assert_eq!(client.fetch_logs(&handle).await.unwrap(), embedded);
    }

    #[tokio::test]
    async fn relative_rules_paths_are_submitted_absolute() {
        let tmp = TempDir::new().unwrap();
        let client = client(&tmp).await;

        let cwd = std::env::current_dir().unwrap();
        let rules_dir = tempfile::Builder::new()
            .prefix("rules-")
            .tempdir_in(&cwd)
            .unwrap();
        std::fs::write(rules_dir.path().join("shared.md"), "shared").unwrap();
        std::fs::write(rules_dir.path().join("inline.md"), "inline").unwrap();
        let relative = rules_dir.path().strip_prefix(&cwd).unwrap();

        let mut d = descriptor();
        d.rules_file = Some(relative.join("x_rules.md"));
        d.rules = Some(relative.join("inline.md").to_string_lossy().into_owned());
        let shared = relative.join("shared.md");
        client.submit(&d, "db", Some(shared.as_path())).await.unwrap();

        let task = client.broker().claim("w").await.unwrap().unwrap().task;
        assert_eq!(task.shared_rules_path, Some(rules_dir.path().join("shared.md")));
        assert_eq!(
            task.descriptor.rules_file,
            Some(rules_dir.path().join("x_rules.md"))
        );
        assert_eq!(
            task.descriptor.rules.map(PathBuf::from),
            Some(rules_dir.path().join("inline.md"))
        );
    }

    #[tokio::test]
    async fn literal_inline_rules_are_left_alone() {
        let tmp = TempDir::new().unwrap();
        let client = client(&tmp).await;

        let mut d = descriptor();
        d.rules = Some("Always use snake_case".into());
        client.submit(&d, "db", None).await.unwrap();

        let task = client.broker().claim("w").await.unwrap().unwrap().task;
        assert_eq!(task.descriptor.rules.as_deref(), Some("Always use snake_case"));
        assert!(task.shared_rules_path.is_none());
    }
}
