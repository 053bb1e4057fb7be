//! Task bundle resolution.
//!
//! A bundle is either an explicit JSON document with a `tasks` array, or a
//! convention-based triplet of files sharing a task name:
//!
//! - `{name}_array.json`: array of strings or objects, one task per item
//! - `{name}_instructions.json`: object keyed `{name}_instructions` or
//!   `default_instructions`, value a string or a list of lines
//! - `{name}_rules.md`: optional, attached by path to every task
//!
//! Every problem is reported as a [`ConfigError`] before any task is submitted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Database name used when a bundle does not name one.
pub const DEFAULT_DATABASE: &str = "targetdbname";

fn default_task_type() -> String {
    "unknown".to_string()
}

/// Normalized unit of work: a prompt template, its payload, and optional rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub task_data: Map<String, Value>,
    /// Template with one `{name}` placeholder for the JSON payload.
    #[serde(default)]
    pub instructions: String,
    /// Inline rules text, or a path to a rules file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_identifier: Option<String>,
    /// Folder key holding the durable log; `logs_folder` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_folder_key: Option<String>,
}

impl TaskDescriptor {
    /// Label used in log file names: explicit identifier, then
    /// `task_data.identifier`, then the task type.
    pub fn identifier(&self) -> String {
        if let Some(id) = &self.task_identifier {
            return id.clone();
        }
        match self.task_data.get("identifier") {
            Some(Value::String(s)) => s.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => self.task_type.clone(),
        }
    }

    pub fn log_folder_key(&self) -> &str {
        self.log_folder_key.as_deref().unwrap_or("logs_folder")
    }
}

/// A resolved set of tasks sharing one database name.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub database_name: String,
    pub tasks: Vec<TaskDescriptor>,
}

/// Load an explicit JSON bundle.
pub fn load_bundle(path: &Path) -> Result<Bundle, ConfigError> {
    let document = read_json(path)?;

    let tasks = match document.get("tasks") {
        None => return Err(ConfigError::MissingTasks(path.to_path_buf())),
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(_) => return Err(ConfigError::EmptyTasks(path.to_path_buf())),
    };

    let mut descriptors = Vec::with_capacity(tasks.len());
    for (index, item) in tasks.iter().enumerate() {
        let descriptor: TaskDescriptor =
            serde_json::from_value(item.clone()).map_err(|e| ConfigError::InvalidTask {
                index,
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if descriptor.instructions.trim().is_empty() {
            return Err(ConfigError::EmptyInstructions {
                index,
                path: path.to_path_buf(),
            });
        }
        descriptors.push(descriptor);
    }

    let database_name = document
        .get("database_name")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_DATABASE)
        .to_string();

    tracing::info!(path = %path.display(), tasks = descriptors.len(), "Loaded task bundle");

    Ok(Bundle {
        database_name,
        tasks: descriptors,
    })
}

/// Load a convention-based bundle for `task_name` from `base_path`.
///
/// The rules file is attached by absolute path, since workers resolve paths
/// from their own working directory.
pub fn load_convention(task_name: &str, base_path: &Path) -> Result<Bundle, ConfigError> {
    let base_path = std::path::absolute(base_path).map_err(|source| ConfigError::Read {
        path: base_path.to_path_buf(),
        source,
    })?;
    let array_file = base_path.join(format!("{task_name}_array.json"));
    let instructions_file = base_path.join(format!("{task_name}_instructions.json"));
    let rules_file = base_path.join(format!("{task_name}_rules.md"));

    let items = match read_json(&array_file)? {
        Value::Array(items) => items,
        _ => return Err(ConfigError::NotAnArray { path: array_file }),
    };

    let instructions = read_instructions(task_name, &instructions_file)?;
    let rules_file = rules_file.is_file().then_some(rules_file);

    let mut tasks = Vec::with_capacity(items.len());
    for item in items {
        let (task_data, identifier) = match item {
            Value::String(s) => {
                let mut data = Map::new();
                data.insert("identifier".into(), Value::String(s.clone()));
                data.insert("name".into(), Value::String(s.clone()));
                (data, s)
            }
            Value::Object(obj) => {
                let identifier = derive_identifier(&obj, task_name);
                (obj, identifier)
            }
            other => {
                tracing::warn!(item = %other, "Skipping array item that is neither a string nor an object");
                continue;
            }
        };

        tasks.push(TaskDescriptor {
            task_type: task_name.to_string(),
            task_data,
            instructions: instructions.clone(),
            rules: None,
            rules_file: rules_file.clone(),
            task_identifier: Some(identifier),
            log_folder_key: None,
        });
    }

    tracing::info!(
        array = %array_file.display(),
        instructions = %instructions_file.display(),
        rules = ?rules_file,
        tasks = tasks.len(),
        "Loaded convention-based tasks"
    );

    Ok(Bundle {
        database_name: DEFAULT_DATABASE.to_string(),
        tasks,
    })
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::InvalidJson {
        path: path.to_path_buf(),
        source,
    })
}

fn read_instructions(task_name: &str, path: &Path) -> Result<String, ConfigError> {
    let key = format!("{task_name}_instructions");
    let document = read_json(path)?;

    let missing = || ConfigError::MissingInstructions {
        key: key.clone(),
        path: path.to_path_buf(),
    };

    let value = document
        .get(&key)
        .or_else(|| document.get("default_instructions"))
        .ok_or_else(missing)?;

    let instructions = match value {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines
            .iter()
            .map(|line| match line {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return Err(missing()),
    };

    if instructions.trim().is_empty() {
        return Err(missing());
    }
    Ok(instructions)
}

/// `identifier` key if present, otherwise the first value with path
/// separators flattened.
fn derive_identifier(obj: &Map<String, Value>, task_name: &str) -> String {
    if let Some(id) = obj.get("identifier") {
        return match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    }
    let first = match obj.values().next() {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => task_name.to_string(),
    };
    first.replace(['/', '\\'], "_")
}
