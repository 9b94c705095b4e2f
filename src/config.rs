// Registry configuration
// Loaded from a JSON file passed with --config; every field is optional.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default trampoline depth limit, matching the usual script VM C-call limit.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of nested trampoline frames per execution thread.
    /// Calls past the limit fail with `StackOverflow`.
    pub max_call_depth: usize,

    /// Reject hooks capturing more upvalues than the managed original.
    pub enforce_capture_check: bool,

    /// Default log filter for the CLI when RUST_LOG is unset
    pub log_level: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            enforce_capture_check: true,
            log_level: "info".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }
}
