use super::schema::{AppConfig, PartialConfig};
use std::path::PathBuf;

/// Default tool invocation: read the prompt on stdin, print the answer.
pub const DEFAULT_TOOL_COMMAND: &str = "claude";
pub const DEFAULT_TOOL_ARGS: &[&str] = &["--print", "--dangerously-skip-permissions"];

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For folder maps: key-wise merge, self's entries win.
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        let mut folders = fallback.folders;
        folders.extend(self.folders);

        let mut databases = fallback.databases;
        for (name, overrides) in self.databases {
            databases.entry(name).or_default().extend(overrides);
        }

        PartialConfig {
            state_dir: self.state_dir.or(fallback.state_dir),
            poll_interval_secs: self.poll_interval_secs.or(fallback.poll_interval_secs),
            result_timeout_secs: self.result_timeout_secs.or(fallback.result_timeout_secs),
            worker_concurrency: self.worker_concurrency.or(fallback.worker_concurrency),
            pid_file: self.pid_file.or(fallback.pid_file),
            worker_log: self.worker_log.or(fallback.worker_log),
            tool_command: self.tool_command.or(fallback.tool_command),
            tool_args: self.tool_args.or(fallback.tool_args),
            folders,
            databases,
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        let state_dir = self
            .state_dir
            .unwrap_or_else(|| PathBuf::from(".genqueue"));
        let logs_dir = state_dir.join("logs");

        let mut folders = self.folders;
        folders
            .entry("logs_folder".to_string())
            .or_insert_with(|| logs_dir.join("general_tasks"));

        AppConfig {
            broker_path: state_dir.join("broker.db"),
            log_store_path: state_dir.join("logs.db"),
            poll_interval_secs: self.poll_interval_secs.unwrap_or(2),
            result_timeout_secs: self.result_timeout_secs.unwrap_or(30),
            worker_concurrency: self.worker_concurrency.unwrap_or(4).max(1),
            pid_file: self
                .pid_file
                .unwrap_or_else(|| logs_dir.join("genqueue_worker.pid")),
            worker_log: self
                .worker_log
                .unwrap_or_else(|| logs_dir.join("genqueue_worker.log")),
            tool_command: self
                .tool_command
                .unwrap_or_else(|| DEFAULT_TOOL_COMMAND.to_string()),
            tool_args: self
                .tool_args
                .unwrap_or_else(|| DEFAULT_TOOL_ARGS.iter().map(|s| s.to_string()).collect()),
            folders,
            databases: self.databases,
            state_dir,
        }
    }
}
