use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const DEFAULT_CONFIG_NAME: &str = "quire.config.json";

/// Engine configuration file format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum trigger passes per model before the cascade is abandoned
    #[serde(default = "default_trigger_iteration_limit")]
    pub trigger_iteration_limit: usize,

    /// Consult the follow-up hook after each committed change
    #[serde(default = "default_true")]
    pub follow_ups: bool,

    /// Default for `withDependencies` on facade undo/redo
    #[serde(default = "default_true")]
    pub undo_with_dependencies: bool,
}

fn default_trigger_iteration_limit() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Load config from a directory, falling back to defaults when absent
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_path = dir.as_ref().join(DEFAULT_CONFIG_NAME);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_json(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trigger_iteration_limit: default_trigger_iteration_limit(),
            follow_ups: true,
            undo_with_dependencies: true,
        }
    }
}
