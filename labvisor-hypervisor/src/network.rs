//! Network classification: isolation-internal vs. shared uplink networks.

use glob::Pattern;
use tracing::debug;

use crate::error::{HypervisorError, Result};
use crate::vlan::VlanPool;

/// How a logical network name is bound when a template is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    /// Shared trunk network; passed to the backend without a VLAN.
    Uplink,
    /// Named reservation; always bound to the reserved id.
    Reserved(u16),
    /// Topology-internal network; needs an id from the pool.
    Isolated,
}

/// Classifies network names using the uplink name and exclusion mask.
#[derive(Debug, Clone)]
pub struct NetworkClassifier {
    uplink: String,
    exclude: Vec<Pattern>,
}

impl NetworkClassifier {
    /// Build a classifier.
    ///
    /// `exclude_mask` is a comma-separated list of glob patterns; an empty
    /// mask excludes nothing beyond the uplink itself.
    pub fn new(uplink: impl Into<String>, exclude_mask: &str) -> Result<Self> {
        let exclude = exclude_mask
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                Pattern::new(p).map_err(|e| {
                    HypervisorError::InvalidConfig(format!("bad network exclusion pattern {}: {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            uplink: uplink.into(),
            exclude,
        })
    }

    /// Uplink network name.
    pub fn uplink(&self) -> &str {
        &self.uplink
    }

    /// True if `name` is the uplink or matches the exclusion mask.
    pub fn is_excluded(&self, name: &str) -> bool {
        name == self.uplink || self.exclude.iter().any(|p| p.matches(name))
    }

    /// Classify `name` against this mask and the pool's reservations.
    pub fn classify(&self, name: &str, pool: &VlanPool) -> NetworkKind {
        let kind = if self.is_excluded(name) {
            NetworkKind::Uplink
        } else {
            match pool.reserved_by_name(name) {
                Some(reserved) if reserved.on_uplink => NetworkKind::Uplink,
                Some(reserved) => NetworkKind::Reserved(reserved.id),
                None => NetworkKind::Isolated,
            }
        };
        debug!(network = %name, kind = ?kind, "Classified network");
        kind
    }
}
