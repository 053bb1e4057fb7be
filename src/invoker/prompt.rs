//! Rules resolution and prompt assembly.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::bundle::TaskDescriptor;
use crate::error::ToolInvocationError;

/// Placeholder in instructions that receives the task data.
pub const NAME_PLACEHOLDER: &str = "{name}";

/// One place rules can come from. Candidates are tried in order and the first
/// non-empty result wins.
#[derive(Clone, Debug, PartialEq)]
pub enum RulesSource {
    /// Rules file shared by every task of a run.
    Shared(PathBuf),
    /// The descriptor's `rules_file`.
    TaskFile(PathBuf),
    /// Inline `rules` that may name a file.
    InlinePath(String),
    /// Inline `rules` used as literal text.
    Inline(String),
}

impl RulesSource {
    /// Content this source yields, if any. A named file that does not exist
    /// yields nothing; one that exists but cannot be read is an error.
    pub fn load(&self) -> Result<Option<String>, ToolInvocationError> {
        match self {
            RulesSource::Shared(path) | RulesSource::TaskFile(path) => read_if_file(path),
            RulesSource::InlinePath(text) => read_if_file(Path::new(text.trim())),
            RulesSource::Inline(text) => Ok(Some(text.clone())),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            RulesSource::Shared(path) => format!("shared rules {}", path.display()),
            RulesSource::TaskFile(path) => format!("rules file {}", path.display()),
            RulesSource::InlinePath(text) => format!("rules path {}", text.trim()),
            RulesSource::Inline(_) => "inline rules".to_string(),
        }
    }
}

fn read_if_file(path: &Path) -> Result<Option<String>, ToolInvocationError> {
    if path.as_os_str().is_empty() || !path.is_file() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|source| ToolInvocationError::RulesRead {
            path: path.to_path_buf(),
            source,
        })
}

/// Rules candidates for a descriptor, highest precedence first.
pub fn rules_candidates(shared: Option<&Path>, descriptor: &TaskDescriptor) -> Vec<RulesSource> {
    let mut candidates = Vec::new();
    if let Some(path) = shared {
        candidates.push(RulesSource::Shared(path.to_path_buf()));
    }
    if let Some(path) = &descriptor.rules_file {
        candidates.push(RulesSource::TaskFile(path.clone()));
    }
    if let Some(rules) = &descriptor.rules {
        candidates.push(RulesSource::InlinePath(rules.clone()));
        candidates.push(RulesSource::Inline(rules.clone()));
    }
    candidates
}

/// First non-empty rules content, with the source it came from.
pub fn resolve_rules(
    candidates: &[RulesSource],
) -> Result<Option<(RulesSource, String)>, ToolInvocationError> {
    for source in candidates {
        match source.load()? {
            Some(content) if !content.trim().is_empty() => {
                return Ok(Some((source.clone(), content)));
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Substitute the task data into the instructions and append the rules.
///
/// Rules are appended after substitution, so placeholders inside them are
/// left untouched.
pub fn build_prompt(instructions: &str, task_data: &Map<String, Value>, rules: Option<&str>) -> String {
    let data = Value::Object(task_data.clone()).to_string();
    let prompt = instructions.replace(NAME_PLACEHOLDER, &data);
    match rules {
        Some(rules) if !rules.is_empty() => format!("{prompt}\n\n## Rules\n{rules}"),
        _ => prompt,
    }
}
