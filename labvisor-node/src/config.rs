//! Configuration management for the node process.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use labvisor_hypervisor::HypervisorServiceConfiguration;

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/labvisor/node.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node-specific configuration
    pub node: NodeConfig,
    /// Orchestration core configuration
    pub hypervisor: HypervisorServiceConfiguration,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(secs) = args.keep_alive_secs {
            self.hypervisor.keep_alive_secs = secs;
        }
        self
    }

    /// Check the orchestration settings.
    pub fn validate(&self) -> Result<()> {
        self.hypervisor
            .validate()
            .context("Invalid hypervisor configuration")
    }

    /// Physical hosts to reload on every keep-alive tick.
    pub fn managed_hosts(&self) -> Vec<String> {
        self.hypervisor
            .backends
            .iter()
            .map(|b| b.host.clone().unwrap_or_else(|| format!("{}-host", b.name)))
            .collect()
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hostname (auto-detected if not set)
    pub hostname: Option<String>,
}

impl NodeConfig {
    /// Get the hostname, detecting it if not set.
    pub fn get_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}
