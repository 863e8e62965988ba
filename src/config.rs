//! Configuration management for peervault.
//!
//! Configuration can be set via environment variables:
//! - `PEERVAULT_DATA_DIR` - Optional. Directory holding `peers.db` and the
//!   credential key. When unset the store is in-memory and passwords cannot
//!   be stored.
//! - `PEERVAULT_REPO_DIR` - Optional. Repository directory handed to the
//!   remote tool. Defaults to the data directory, then the current directory.
//! - `PEERVAULT_REMOTE_TOOL` - Optional. Storage engine CLI. Defaults to `dolt`.

use std::path::PathBuf;
use thiserror::Error;

pub const DATA_DIR_ENV: &str = "PEERVAULT_DATA_DIR";
pub const REPO_DIR_ENV: &str = "PEERVAULT_REPO_DIR";
pub const REMOTE_TOOL_ENV: &str = "PEERVAULT_REMOTE_TOOL";

/// Default storage engine CLI.
pub const DEFAULT_REMOTE_TOOL: &str = "dolt";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Vault configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Persistent data directory, if any
    pub data_dir: Option<PathBuf>,

    /// Directory the remote tool runs in
    pub repo_dir: PathBuf,

    /// Storage engine command-line tool
    pub remote_tool: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but empty or
    /// not valid UTF-8.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name))
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let read = |name: &str| -> Result<Option<String>, ConfigError> {
            match lookup(name) {
                Ok(value) if value.trim().is_empty() => Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "must not be empty".to_string(),
                )),
                Ok(value) => Ok(Some(value)),
                Err(std::env::VarError::NotPresent) => Ok(None),
                Err(e) => Err(ConfigError::InvalidValue(name.to_string(), e.to_string())),
            }
        };

        let data_dir = read(DATA_DIR_ENV)?.map(PathBuf::from);

        let repo_dir = match read(REPO_DIR_ENV)? {
            Some(dir) => PathBuf::from(dir),
            None => data_dir
                .clone()
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
        };

        let remote_tool = read(REMOTE_TOOL_ENV)?.unwrap_or_else(|| DEFAULT_REMOTE_TOOL.to_string());

        Ok(Self {
            data_dir,
            repo_dir,
            remote_tool,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        let repo_dir = data_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir,
            repo_dir,
            remote_tool: DEFAULT_REMOTE_TOOL.to_string(),
        }
    }
}
