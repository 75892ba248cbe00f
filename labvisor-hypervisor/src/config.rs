//! Hypervisor service configuration.
//!
//! Loaded once at process start and read-only afterwards. The only state
//! derived from it that changes at runtime is the VLAN pool's allocation set.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::deployment::WaitPolicy;
use crate::error::{HypervisorError, Result};
use crate::network::NetworkClassifier;
use crate::vlan::{VlanConfiguration, VlanPool};

/// Static configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorServiceConfiguration {
    /// Registered hypervisor backends
    pub backends: Vec<BackendConfig>,
    /// Storage locations
    pub storage: StorageConfig,
    /// Name of the shared uplink network
    pub uplink: String,
    /// VLAN pool range and reservations
    pub vlan: VlanConfiguration,
    /// Backend keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Comma-separated glob patterns naming external (non-isolated) networks
    pub network_exclude_mask: String,
    /// How long deployments wait for members to come up
    pub deploy_wait: WaitPolicy,
}

impl Default for HypervisorServiceConfiguration {
    fn default() -> Self {
        Self {
            backends: vec![BackendConfig::default()],
            storage: StorageConfig::default(),
            uplink: "uplink".to_string(),
            vlan: VlanConfiguration::default(),
            keep_alive_secs: 30,
            network_exclude_mask: String::new(),
            deploy_wait: WaitPolicy::default(),
        }
    }
}

impl HypervisorServiceConfiguration {
    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(HypervisorError::InvalidConfig(
                "at least one backend must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(HypervisorError::InvalidConfig("backend name is empty".to_string()));
            }
            if !names.insert(backend.name.as_str()) {
                return Err(HypervisorError::InvalidConfig(format!(
                    "backend {} configured twice",
                    backend.name
                )));
            }
        }

        for backend in &self.backends {
            backend.validate()?;
        }

        if self.keep_alive_secs == 0 {
            return Err(HypervisorError::InvalidConfig(
                "keep_alive_secs must be greater than zero".to_string(),
            ));
        }
        if self.uplink.is_empty() {
            return Err(HypervisorError::InvalidConfig("uplink name is empty".to_string()));
        }

        self.vlan.validate()?;
        self.classifier()?;
        Ok(())
    }

    /// Backend keep-alive interval.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Build the network classifier from the uplink name and exclusion mask.
    pub fn classifier(&self) -> Result<NetworkClassifier> {
        NetworkClassifier::new(&self.uplink, &self.network_exclude_mask)
    }

    /// Build the VLAN pool.
    pub fn vlan_pool(&self) -> Result<VlanPool> {
        VlanPool::new(&self.vlan)
    }
}

/// One hypervisor backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Unique backend name
    pub name: String,
    /// Backend technology
    pub kind: BackendKind,
    /// Management endpoint
    pub url: String,
    /// Management user
    pub username: Option<String>,
    /// Management password
    pub password: Option<String>,
    /// Physical host name (defaults to "<name>-host")
    pub host: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            kind: BackendKind::Mock,
            url: String::new(),
            username: None,
            password: None,
            host: None,
        }
    }
}

impl BackendConfig {
    /// Check that the connection settings make sense for the backend kind.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            BackendKind::Mock => {
                let mut unused = Vec::new();
                if !self.url.is_empty() {
                    unused.push("url");
                }
                if self.username.is_some() {
                    unused.push("username");
                }
                if self.password.is_some() {
                    unused.push("password");
                }
                if !unused.is_empty() {
                    return Err(HypervisorError::InvalidConfig(format!(
                        "backend {} is a mock and takes no {}",
                        self.name,
                        unused.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Hypervisor backend technology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-memory backend for testing/development
    #[default]
    Mock,
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// VM configuration store
    pub vm_store: String,
    /// Disk image store
    pub disk_store: String,
    /// ISO image store
    pub iso_store: String,
    /// qemu-img binary; sparse files are used when unset
    pub qemu_img: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            vm_store: "/var/lib/labvisor/vms".to_string(),
            disk_store: "/var/lib/labvisor/disks".to_string(),
            iso_store: "/var/lib/labvisor/isos".to_string(),
            qemu_img: None,
        }
    }
}
