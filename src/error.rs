use std::path::PathBuf;

/// Errors related to loading the layered TOML settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse settings at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("No folder configured for key '{key}' (database '{database}')")]
    MissingFolder { key: String, database: String },
}

/// Errors raised while resolving a task bundle. Always fatal before any task runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing 'tasks' array in {0}")]
    MissingTasks(PathBuf),

    #[error("'tasks' must be a non-empty list in {0}")]
    EmptyTasks(PathBuf),

    #[error("{path} must contain a JSON array")]
    NotAnArray { path: PathBuf },

    #[error("No '{key}' or 'default_instructions' found in {path}")]
    MissingInstructions { key: String, path: PathBuf },

    #[error("Task {index} in {path} has no instructions")]
    EmptyInstructions { index: usize, path: PathBuf },

    #[error("Invalid task {index} in {path}: {message}")]
    InvalidTask {
        index: usize,
        path: PathBuf,
        message: String,
    },
}

/// Errors that fail a single task execution (the handle ends in FAILURE).
#[derive(Debug, thiserror::Error)]
pub enum ToolInvocationError {
    #[error("No instructions provided in task configuration")]
    NoInstructions,

    #[error("Target folder not found or does not exist: {0}")]
    TargetFolderMissing(String),

    #[error("Folder resolution failed: {0}")]
    Settings(#[from] SettingsError),

    #[error("Failed to open log file {path} after {attempts} attempts: {source}")]
    LogFileOpen {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read rules from {path}: {source}")]
    RulesRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn tool `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool exited with status {code}: {stderr}")]
    NonZeroExit { code: String, stderr: String },

    #[error("Tool run was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recoverable problems while post-processing tool output.
#[derive(Debug, thiserror::Error)]
pub enum OutputParseError {
    #[error("Tool output was not a JSON object: {0}")]
    NotJson(String),

    #[error("Refusing to write `{path}`: {reason}")]
    RejectedPath { path: String, reason: String },

    #[error("Failed to write `{path}`: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the broker queue or the live log store.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable at {path}: {message}")]
    Unavailable { path: PathBuf, message: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(String),

    #[error("Cannot resolve path {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors starting or locating the worker pool process.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to access PID file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Worker process {0} exited immediately; check the worker log")]
    ExitedImmediately(u32),
}
