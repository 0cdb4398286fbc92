//! Project configuration file support.
//!
//! Loads configuration from `reflexion.toml` in the working directory.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use reflexion_core::LoopConfig;

/// Project-level configuration loaded from `reflexion.toml`
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Command the worker proxy spawns
    pub worker: Option<RoleCommand>,
    /// Command the reviewer proxy spawns
    pub reviewer: Option<RoleCommand>,
    /// Optional command for instruction revision; the templated fallback
    /// is used when absent
    pub generator: Option<RoleCommand>,
    /// Loop tuning knobs
    #[serde(default, rename = "loop")]
    pub loop_config: LoopConfig,
}

/// How to spawn one collaborator
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleCommand {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The config file name
pub const CONFIG_FILE_NAME: &str = "reflexion.toml";

impl ProjectConfig {
    /// Load configuration from the working directory.
    ///
    /// Returns:
    /// - `Ok(Some(config))` if file exists and parses successfully
    /// - `Ok(None)` if file does not exist
    /// - `Err(...)` if file exists but fails to parse (hard error)
    pub fn load(working_dir: &Path) -> Result<Option<Self>> {
        let config_path = working_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: ProjectConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        Ok(Some(config))
    }
}
