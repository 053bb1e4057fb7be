//! Tool output parsing and artifact persistence.

use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::OutputParseError;

/// Parse tool stdout as a flat JSON object of relative path to file content.
pub fn parse_tool_output(raw: &str) -> Result<Map<String, Value>, OutputParseError> {
    serde_json::from_str::<Map<String, Value>>(raw.trim())
        .map_err(|e| OutputParseError::NotJson(e.to_string()))
}

/// Confines writes to the target folder.
///
/// Lexical checks reject absolute and `..` paths up front; after parent
/// directories are created the canonical parent is checked again so a
/// symlink inside the target cannot redirect the write outside it.
pub struct TargetGuard {
    canonical_root: PathBuf,
}

impl TargetGuard {
    pub fn new(target: &Path) -> std::io::Result<Self> {
        Ok(Self {
            canonical_root: std::fs::canonicalize(target)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.canonical_root
    }

    /// Destination for `relative`, or the reason it is refused.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, OutputParseError> {
        let reject = |reason: &str| OutputParseError::RejectedPath {
            path: relative.to_string(),
            reason: reason.to_string(),
        };

        let path = Path::new(relative);
        if relative.trim().is_empty() {
            return Err(reject("empty path"));
        }
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => return Err(reject("path escapes the target folder")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(reject("absolute paths are not allowed"));
                }
            }
        }
        if path.file_name().is_none() {
            return Err(reject("path has no file name"));
        }
        Ok(self.canonical_root.join(path))
    }

    /// Create parent directories of `dest` and confirm they still resolve
    /// inside the root.
    fn prepare(&self, relative: &str, dest: &Path) -> Result<(), OutputParseError> {
        let parent = dest.parent().unwrap_or(&self.canonical_root);
        std::fs::create_dir_all(parent).map_err(|source| OutputParseError::WriteFailed {
            path: dest.to_path_buf(),
            source,
        })?;
        let canonical_parent =
            std::fs::canonicalize(parent).map_err(|source| OutputParseError::WriteFailed {
                path: dest.to_path_buf(),
                source,
            })?;
        if !canonical_parent.starts_with(&self.canonical_root) {
            return Err(OutputParseError::RejectedPath {
                path: relative.to_string(),
                reason: "path resolves outside the target folder".to_string(),
            });
        }
        Ok(())
    }

    /// Write one file.
    pub fn write(&self, relative: &str, content: &Value) -> Result<PathBuf, OutputParseError> {
        let Some(content) = content.as_str() else {
            return Err(OutputParseError::RejectedPath {
                path: relative.to_string(),
                reason: "content is not a string".to_string(),
            });
        };
        let dest = self.resolve(relative)?;
        self.prepare(relative, &dest)?;
        std::fs::write(&dest, content).map_err(|source| OutputParseError::WriteFailed {
            path: dest.clone(),
            source,
        })?;
        Ok(dest)
    }
}

/// Outcome of writing a parsed output map.
#[derive(Debug, Default)]
pub struct WriteReport {
    pub written: Vec<PathBuf>,
    pub refused: Vec<OutputParseError>,
}

/// Write every entry under the guard's root. Individual failures are
/// collected, not propagated.
pub fn write_files(guard: &TargetGuard, files: &Map<String, Value>) -> WriteReport {
    let mut report = WriteReport::default();
    for (path, content) in files {
        match guard.write(path, content) {
            Ok(dest) => report.written.push(dest),
            Err(e) => report.refused.push(e),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn parses_flat_object() {
        let files = parse_tool_output("  {\"a.txt\": \"x\", \"b/c.txt\": \"y\"}\n").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files["b/c.txt"], "y");
    }

    #[test]
    fn non_json_and_non_object_are_rejected() {
        assert!(matches!(
            parse_tool_output("I wrote the files for you."),
            Err(OutputParseError::NotJson(_))
        ));
        assert!(parse_tool_output("[\"a\"]").is_err());
    }

    #[test]
    fn writes_nested_files() {
        let tmp = TempDir::new().unwrap();
        let guard = TargetGuard::new(tmp.path()).unwrap();
        let files = parse_tool_output(r#"{"foo/bar.txt": "hello"}"#).unwrap();

        let report = write_files(&guard, &files);
        assert!(report.refused.is_empty());
        assert_eq!(report.written.len(), 1);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("foo/bar.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn escaping_paths_are_refused() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target");
        std::fs::create_dir(&target).unwrap();
        let guard = TargetGuard::new(&target).unwrap();

        for path in ["../evil.txt", "/etc/evil.txt", "a/../../evil.txt", ""] {
            assert!(
                matches!(guard.resolve(path), Err(OutputParseError::RejectedPath { .. })),
                "{path:?} should be refused"
            );
        }
        assert!(!tmp.path().join("evil.txt").exists());
    }

    #[test]
    fn non_string_content_is_refused_without_stopping_others() {
        let tmp = TempDir::new().unwrap();
        let guard = TargetGuard::new(tmp.path()).unwrap();
        let files = json!({"ok.txt": "fine", "bad.txt": 42});

        let report = write_files(&guard, files.as_object().unwrap());
        assert_eq!(report.written.len(), 1);
        assert_eq!(report.refused.len(), 1);
        assert!(!tmp.path().join("bad.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_cannot_escape() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target");
        let outside = tmp.path().join("outside");
        std::fs::create_dir(&target).unwrap();
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, target.join("link")).unwrap();

        let guard = TargetGuard::new(&target).unwrap();
        let err = guard.write("link/x.txt", &json!("data")).unwrap_err();
        assert!(matches!(err, OutputParseError::RejectedPath { .. }));
        assert!(!outside.join("x.txt").exists());
    }
}
