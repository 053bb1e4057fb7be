use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The TOML file structure for genqueue.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub general: Option<GeneralConfig>,
    pub worker: Option<WorkerConfig>,
    pub tool: Option<ToolConfig>,
    /// Default folder paths keyed by logical name (`logs_folder`, `target_folder`, ...).
    pub folders: Option<BTreeMap<String, String>>,
    /// Per-database folder overrides, consulted before `[folders]`.
    pub databases: Option<BTreeMap<String, DatabaseConfig>>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub state_dir: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub result_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: Option<usize>,
    pub pid_file: Option<String>,
    pub log_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToolConfig {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub folders: BTreeMap<String, String>,
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub state_dir: PathBuf,
    pub broker_path: PathBuf,
    pub log_store_path: PathBuf,
    pub poll_interval_secs: u64,
    pub result_timeout_secs: u64,
    pub worker_concurrency: usize,
    pub pid_file: PathBuf,
    pub worker_log: PathBuf,
    pub tool_command: String,
    pub tool_args: Vec<String>,
    pub folders: BTreeMap<String, PathBuf>,
    pub databases: BTreeMap<String, BTreeMap<String, PathBuf>>,
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub state_dir: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub result_timeout_secs: Option<u64>,
    pub worker_concurrency: Option<usize>,
    pub pid_file: Option<PathBuf>,
    pub worker_log: Option<PathBuf>,
    pub tool_command: Option<String>,
    pub tool_args: Option<Vec<String>>,
    pub folders: BTreeMap<String, PathBuf>,
    pub databases: BTreeMap<String, BTreeMap<String, PathBuf>>,
}

impl ConfigFile {
    pub fn to_partial(self) -> PartialConfig {
        let general = self.general;
        let worker = self.worker;
        let tool = self.tool;

        let folders = self
            .folders
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, PathBuf::from(v)))
            .collect();
        let databases = self
            .databases
            .unwrap_or_default()
            .into_iter()
            .map(|(name, db)| {
                let folders = db
                    .folders
                    .into_iter()
                    .map(|(k, v)| (k, PathBuf::from(v)))
                    .collect();
                (name, folders)
            })
            .collect();

        PartialConfig {
            state_dir: general
                .as_ref()
                .and_then(|g| g.state_dir.as_ref().map(PathBuf::from)),
            poll_interval_secs: general.as_ref().and_then(|g| g.poll_interval_secs),
            result_timeout_secs: general.as_ref().and_then(|g| g.result_timeout_secs),
            worker_concurrency: worker.as_ref().and_then(|w| w.concurrency),
            pid_file: worker
                .as_ref()
                .and_then(|w| w.pid_file.as_ref().map(PathBuf::from)),
            worker_log: worker
                .as_ref()
                .and_then(|w| w.log_file.as_ref().map(PathBuf::from)),
            tool_command: tool.as_ref().and_then(|t| t.command.clone()),
            tool_args: tool.and_then(|t| t.args),
            folders,
            databases,
        }
    }
}
