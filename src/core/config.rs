//! Engine configuration
//!
//! Construction-time settings for both cores. The shell gate is a hard
//! gate: when `allow_unsafe_shell` is false, shell actions and shell
//! rollbacks fail regardless of per-step configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::error::{EngineError, Result};

/// Construction-time engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Enable the shell action. Disabled by default.
    pub allow_unsafe_shell: bool,
    /// Upper bound on concurrently running steps within a wave
    pub max_parallel_steps: usize,
    /// Default HTTP action timeout in seconds
    pub http_timeout_secs: u64,
    /// Path to the rules database
    pub rules_db_path: PathBuf,
    /// Machine identifier attached to broadcast events
    pub machine_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("apiary");

        Self {
            allow_unsafe_shell: false,
            max_parallel_steps: 5,
            http_timeout_secs: 20,
            rules_db_path: data_dir.join("rules.db"),
            machine_id: hostname(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EngineError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}
