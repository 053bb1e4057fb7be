pub mod merge;
pub mod schema;

pub use schema::*;

use crate::cli::{Cli, Commands};
use crate::error::SettingsError;
use anyhow::Context;
use std::path::{Path, PathBuf};

/// Name of the settings file looked up in the global config dir and the cwd.
const SETTINGS_FILE: &str = "genqueue.toml";

/// Load configuration by merging global, local, and CLI sources.
/// Precedence: CLI > local (or --config) > global config > defaults.
///
/// Missing implicit config files are handled gracefully (defaults apply).
/// An explicit `--config` path must exist and parse.
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    // Layer 1: Global config (~/.config/genqueue/genqueue.toml or platform equivalent)
    let global = load_global_config();

    // Layer 2: Local config
    let local = match &cli.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings {}", path.display()))?;
            parse_settings(path, &contents)?
        }
        None => load_toml_file(Path::new(SETTINGS_FILE)).unwrap_or_default(),
    };

    // Layer 3: CLI args
    let cli_partial = cli_to_partial(cli);

    Ok(cli_partial
        .with_fallback(local)
        .with_fallback(global)
        .finalize())
}

impl AppConfig {
    /// Resolve a logical folder key for a database.
    ///
    /// Lookup order: `[databases.<name>.folders]`, then `[folders]` (which
    /// already carries the built-in `logs_folder` default).
    pub fn resolve_folder(&self, database: &str, key: &str) -> Result<PathBuf, SettingsError> {
        self.databases
            .get(database)
            .and_then(|folders| folders.get(key))
            .or_else(|| self.folders.get(key))
            .cloned()
            .ok_or_else(|| SettingsError::MissingFolder {
                key: key.to_string(),
                database: database.to_string(),
            })
    }
}

fn parse_settings(path: &Path, contents: &str) -> Result<PartialConfig, SettingsError> {
    toml::from_str::<ConfigFile>(contents)
        .map(ConfigFile::to_partial)
        .map_err(|e| SettingsError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Load global config from the platform-specific config directory.
/// Returns empty PartialConfig if file not found.
fn load_global_config() -> PartialConfig {
    match global_config_path() {
        Some(p) => load_toml_file(&p).unwrap_or_default(),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

/// Load and parse a TOML config file into a PartialConfig.
/// Returns None on file-not-found; parse errors are logged and ignored.
fn load_toml_file(path: &Path) -> Option<PartialConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match parse_settings(path, &contents) {
            Ok(partial) => {
                tracing::info!("Loaded config from {}", path.display());
                Some(partial)
            }
            Err(e) => {
                tracing::warn!("Config parse error: {}", e);
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("Failed to read config at {}: {}", path.display(), e);
            None
        }
    }
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/genqueue/genqueue.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "genqueue")
        .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    let worker_concurrency = match &cli.command {
        Commands::Worker { concurrency } => *concurrency,
        _ => None,
    };
    PartialConfig {
        state_dir: cli.state_dir.clone(),
        worker_concurrency,
        ..Default::default()
    }
}
