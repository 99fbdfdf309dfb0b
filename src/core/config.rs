//! WR-008: Control-plane configuration (`wsinfra.yaml`).
//!
//! Every field has a default, so an absent file or a partial file is valid.

use super::error::{InfraError, Result};
use super::types::Installer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Root for runtime records, event logs, and machine directories
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub recipe: RecipeConfig,

    #[serde(default)]
    pub local: LocalConfig,

    /// Directory of `*.yaml` installer definitions
    #[serde(default)]
    pub installers_dir: Option<PathBuf>,

    /// Inline installer definitions
    #[serde(default)]
    pub installers: Vec<Installer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeConfig {
    /// HTTP(S) fetch timeout in seconds, 0 disables the timeout
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_recipe_types")]
    pub recipe_types: Vec<String>,

    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_recipe_types() -> Vec<String> {
    vec!["script".to_string()]
}

fn default_shell() -> String {
    "bash".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            log: LogConfig::default(),
            recipe: RecipeConfig::default(),
            local: LocalConfig::default(),
            installers_dir: None,
            installers: Vec::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recipe_types: default_recipe_types(),
            shell: default_shell(),
        }
    }
}

impl RecipeConfig {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_secs > 0).then(|| Duration::from_secs(self.fetch_timeout_secs))
    }
}

/// Load configuration. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<ControlPlaneConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(ControlPlaneConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| InfraError::Validation(format!("cannot read {}: {}", path.display(), e)))?;
    if content.trim().is_empty() {
        return Ok(ControlPlaneConfig::default());
    }
    serde_yaml_ng::from_str(&content)
        .map_err(|e| InfraError::Validation(format!("invalid config {}: {}", path.display(), e)))
}
