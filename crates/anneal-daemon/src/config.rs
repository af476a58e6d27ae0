//! Configuration loading and validation

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub tss: TssConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Label announced to the restore daemon
    #[serde(default = "default_label")]
    pub label: String,
    /// Message receive timeout in seconds
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            receive_timeout_secs: default_receive_timeout(),
        }
    }
}

fn default_label() -> String {
    "anneal".to_string()
}

fn default_receive_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TssConfig {
    /// Ticket authority endpoint handed to the transport
    #[serde(default = "default_tss_url")]
    pub url: String,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            url: default_tss_url(),
        }
    }
}

fn default_tss_url() -> String {
    "http://gs.apple.com/TSS/controller?action=2".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Erase install instead of update
    #[serde(default)]
    pub erase: bool,
    /// Skip sending the NOR payload
    #[serde(default)]
    pub exclude_nor: bool,
    /// Turn per-request fatals into warnings
    #[serde(default)]
    pub ignore_errors: bool,
    /// Extra kernel boot-args for the restored OS
    #[serde(default)]
    pub boot_args: Option<String>,
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
