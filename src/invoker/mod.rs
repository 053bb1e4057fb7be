//! External tool invoker: runs one task descriptor end to end.
//!
//! A run resolves its folders, opens the durable log, assembles the prompt,
//! hands it to the tool, and turns the tool's stdout into files under the
//! target folder. The temp prompt file and the log handle are released on
//! every exit path.

pub mod output;
pub mod prompt;
pub mod task_log;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::bundle::TaskDescriptor;
use crate::config::AppConfig;
use crate::error::ToolInvocationError;
use crate::exec::{ToolCommand, run_tool};
use crate::logstream::LogEntry;

pub use task_log::TaskLogger;

/// Folder key naming where generated files are written.
pub const TARGET_FOLDER_KEY: &str = "target_folder";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// What became of the tool's stdout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Parsed as a path → content map and written out.
    Files,
    /// Not a JSON object; kept verbatim in the durable log.
    Raw,
    /// The tool never produced output (failed runs).
    #[default]
    None,
}

/// Outcome of one execution, stored by the broker as the task's result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub task_type: String,
    pub task_data: Map<String, Value>,
    pub log_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub output: OutputKind,
    #[serde(default)]
    pub written_files: Vec<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl ExecutionResult {
    /// Result recorded for an execution that ended in an error.
    pub fn failed(descriptor: &TaskDescriptor, log_file: Option<&Path>, error: String) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            task_type: descriptor.task_type.clone(),
            task_data: descriptor.task_data.clone(),
            log_file: log_file
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            error: Some(error),
            output: OutputKind::None,
            written_files: Vec::new(),
            logs: Vec::new(),
        }
    }
}

/// Durable log name: `{identifier}_{task_type}_logs_{YYYYmmdd_HHMMSS}_{8 hex}.log`.
pub fn log_file_name(descriptor: &TaskDescriptor, run_id: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let name = format!(
        "{}_{}_logs_{timestamp}_{run_id}.log",
        descriptor.identifier(),
        descriptor.task_type
    );
    name.replace(['/', '\\'], "_")
}

pub struct Invoker {
    config: AppConfig,
}

impl Invoker {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    fn tool(&self) -> ToolCommand {
        ToolCommand {
            program: self.config.tool_command.clone(),
            args: self.config.tool_args.clone(),
        }
    }

    /// Execute `descriptor` against the folders of `database_name`.
    ///
    /// `cancel` aborts a running tool (its whole process group is killed)
    /// and yields [`ToolInvocationError::Cancelled`]. Errors are logged to
    /// every sink of `logger` before the durable log is closed.
    pub async fn execute(
        &self,
        descriptor: &TaskDescriptor,
        database_name: &str,
        shared_rules: Option<&Path>,
        logger: &mut TaskLogger,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ToolInvocationError> {
        let outcome = self
            .prepare_and_run(descriptor, database_name, shared_rules, logger, cancel)
            .await;

        if let Err(e) = &outcome {
            logger.set_status("Failed").await;
            logger.error(format!("Error processing task: {e}")).await;
        }
        if let Some(path) = logger.log_path().map(|p| p.display().to_string()) {
            logger.info(format!("Log saved to: {path}")).await;
        }
        logger.detach_file();
        outcome
    }

    async fn prepare_and_run(
        &self,
        descriptor: &TaskDescriptor,
        database_name: &str,
        shared_rules: Option<&Path>,
        logger: &mut TaskLogger,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ToolInvocationError> {
        logger.set_status("Starting task").await;
        if descriptor.instructions.trim().is_empty() {
            return Err(ToolInvocationError::NoInstructions);
        }

        let candidates = prompt::rules_candidates(shared_rules, descriptor);
        let rules = prompt::resolve_rules(&candidates)?;
        if let Some((source, _)) = &rules {
            logger.info(format!("Loaded {}", source.describe())).await;
        }

        let logs_folder = std::path::absolute(
            self.config
                .resolve_folder(database_name, descriptor.log_folder_key())?,
        )?;
        task_log::ensure_log_dir(&logs_folder)?;

        let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let log_path = logs_folder.join(log_file_name(descriptor, &run_id));
        logger.attach_file(&log_path).await?;

        let prompt_path = logs_folder.join(format!("temp_prompt_{run_id}.txt"));
        let outcome = self
            .run(
                descriptor,
                database_name,
                rules.map(|(_, content)| content),
                &log_path,
                &prompt_path,
                logger,
                cancel,
            )
            .await;

        if prompt_path.exists() {
            if let Err(e) = std::fs::remove_file(&prompt_path) {
                logger
                    .warn(format!("Could not remove temp prompt {}: {e}", prompt_path.display()))
                    .await;
            }
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        descriptor: &TaskDescriptor,
        database_name: &str,
        rules: Option<String>,
        log_path: &Path,
        prompt_path: &Path,
        logger: &mut TaskLogger,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ToolInvocationError> {
        let target = self
            .config
            .resolve_folder(database_name, TARGET_FOLDER_KEY)
            .map_err(|e| ToolInvocationError::TargetFolderMissing(e.to_string()))?;
        if !target.is_dir() {
            return Err(ToolInvocationError::TargetFolderMissing(
                target.display().to_string(),
            ));
        }

        let pretty = serde_json::to_string_pretty(&descriptor.task_data).unwrap_or_default();
        logger
            .info(format!(
                "Starting task execution\n   Type: {}\n   Data: {pretty}\n   Log file: {}",
                descriptor.task_type,
                log_path.display()
            ))
            .await;

        let prompt = prompt::build_prompt(
            &descriptor.instructions,
            &descriptor.task_data,
            rules.as_deref(),
        );
        std::fs::write(prompt_path, &prompt)?;

        let tool = self.tool();
        logger.set_status("Running tool").await;
        logger
            .info(format!(
                "Working directory: {}\n   Executing: {}",
                target.display(),
                tool.display()
            ))
            .await;

        let (stdout, offset) = logger.tool_stdout()?;
        let exec = run_tool(&tool, &target, prompt_path, stdout, cancel).await?;
        if exec.cancelled {
            return Err(ToolInvocationError::Cancelled);
        }

        let raw = logger.read_since(offset)?;
        logger
            .info(format!("Tool finished, {} bytes of output", raw.len()))
            .await;
        let stderr = exec.stderr.trim();
        if !stderr.is_empty() {
            logger.warn(format!("Tool stderr:\n{stderr}")).await;
        }
        if !exec.success() {
            return Err(ToolInvocationError::NonZeroExit {
                code: exec
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: stderr.to_string(),
            });
        }

        logger.set_status("Writing files").await;
        let (output, written_files) = match output::parse_tool_output(&raw) {
            Ok(files) => {
                let guard = output::TargetGuard::new(&target)?;
                let report = output::write_files(&guard, &files);
                for refused in &report.refused {
                    logger.error(refused.to_string()).await;
                }
                let written: Vec<String> = report
                    .written
                    .iter()
                    .map(|p| display_relative(p, guard.root()))
                    .collect();
                for path in &written {
                    logger.info(format!("Wrote {path}")).await;
                }
                (OutputKind::Files, written)
            }
            Err(e) => {
                logger
                    .warn(format!("{e}; raw output kept in {}", log_path.display()))
                    .await;
                (OutputKind::Raw, Vec::new())
            }
        };

        logger.set_status("Completed").await;
        logger.info("Successfully completed task").await;

        Ok(ExecutionResult {
            status: ExecutionStatus::Success,
            task_type: descriptor.task_type.clone(),
            task_data: descriptor.task_data.clone(),
            log_file: log_path.display().to_string(),
            error: None,
            output,
            written_files,
            logs: Vec::new(),
        })
    }
}

fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .map(PathBuf::from)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_serializes_lowercase_status() {
        let descriptor = TaskDescriptor {
            task_type: "crud".into(),
            task_data: Map::new(),
            instructions: "x".into(),
            rules: None,
            rules_file: None,
            task_identifier: None,
            log_folder_key: None,
        };
        let result = ExecutionResult::failed(&descriptor, None, "nope".into());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["output"], "none");
        assert_eq!(json["error"], "nope");
        assert_eq!(json["log_file"], "");
    }

    #[test]
    fn log_file_name_has_expected_shape() {
        let descriptor = TaskDescriptor {
            task_type: "crud".into(),
            task_data: serde_json::json!({"identifier": "users"})
                .as_object()
                .cloned()
                .unwrap(),
            instructions: "x".into(),
            rules: None,
            rules_file: None,
            task_identifier: None,
            log_folder_key: None,
        };
        let name = log_file_name(&descriptor, "abcd1234");
        assert!(name.starts_with("users_crud_logs_"));
        assert!(name.ends_with("_abcd1234.log"));
        // users_crud_logs_ + YYYYmmdd_HHMMSS + _abcd1234.log
        assert_eq!(name.len(), "users_crud_logs_".len() + 15 + "_abcd1234.log".len());
    }
}
