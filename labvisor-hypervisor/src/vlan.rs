//! VLAN allocation engine.
//!
//! The pool hands out VLAN ids from an inclusive range, lowest first, and
//! never hands out a reserved id or an id that is still in use. Allocation
//! and release share one lock; that lock is the only point where concurrent
//! deployments wait on each other.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{HypervisorError, Result};

/// Lowest usable 802.1Q id.
pub const MIN_VLAN_ID: u16 = 1;
/// Highest usable 802.1Q id.
pub const MAX_VLAN_ID: u16 = 4094;

/// A pre-assigned VLAN, addressed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedVlan {
    pub id: u16,
    pub name: String,
    /// Carried on the uplink trunk (treated as a shared, external network)
    #[serde(default)]
    pub on_uplink: bool,
}

/// VLAN pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VlanConfiguration {
    /// First id of the range (inclusive)
    pub start: u16,
    /// Last id of the range (inclusive)
    pub end: u16,
    /// Ids excluded from ad-hoc allocation
    pub reserved: Vec<ReservedVlan>,
}

impl Default for VlanConfiguration {
    fn default() -> Self {
        Self {
            start: 100,
            end: 3999,
            reserved: Vec::new(),
        }
    }
}

impl VlanConfiguration {
    /// Build a configuration for `start..=end` with no reservations.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            reserved: Vec::new(),
        }
    }

    /// Add a reserved entry.
    pub fn with_reserved(mut self, id: u16, name: impl Into<String>, on_uplink: bool) -> Self {
        self.reserved.push(ReservedVlan {
            id,
            name: name.into(),
            on_uplink,
        });
        self
    }

    /// Check range bounds and reservation uniqueness.
    pub fn validate(&self) -> Result<()> {
        if self.start < MIN_VLAN_ID || self.end > MAX_VLAN_ID {
            return Err(HypervisorError::InvalidConfig(format!(
                "VLAN range {}-{} outside {}-{}",
                self.start, self.end, MIN_VLAN_ID, MAX_VLAN_ID
            )));
        }
        if self.start > self.end {
            return Err(HypervisorError::InvalidConfig(format!(
                "VLAN range start {} is after end {}",
                self.start, self.end
            )));
        }

        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        for entry in &self.reserved {
            if !(MIN_VLAN_ID..=MAX_VLAN_ID).contains(&entry.id) {
                return Err(HypervisorError::InvalidConfig(format!(
                    "reserved VLAN {} ({}) is not a valid id",
                    entry.id, entry.name
                )));
            }
            if !ids.insert(entry.id) {
                return Err(HypervisorError::InvalidConfig(format!(
                    "VLAN {} reserved twice",
                    entry.id
                )));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(HypervisorError::InvalidConfig(format!(
                    "reserved VLAN name {} used twice",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}

/// The shared VLAN pool.
///
/// Constructed once from configuration and passed around as `Arc<VlanPool>`.
#[derive(Debug)]
pub struct VlanPool {
    range: RangeInclusive<u16>,
    reserved: Vec<ReservedVlan>,
    in_use: Mutex<BTreeSet<u16>>,
}

impl VlanPool {
    /// Create a pool from validated configuration.
    pub fn new(config: &VlanConfiguration) -> Result<Self> {
        config.validate()?;
        info!(
            start = config.start,
            end = config.end,
            reserved = config.reserved.len(),
            "VLAN pool initialized"
        );
        Ok(Self {
            range: config.start..=config.end,
            reserved: config.reserved.clone(),
            in_use: Mutex::new(BTreeSet::new()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeSet<u16>>> {
        self.in_use
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn is_reserved(&self, id: u16) -> bool {
        self.reserved.iter().any(|r| r.id == id)
    }

    /// Claim `count` ids, lowest available first.
    ///
    /// All or nothing: on `PoolExhausted` no id has been claimed.
    pub fn allocate(&self, count: usize) -> Result<Vec<u16>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut in_use = self.lock()?;
        let ids: Vec<u16> = self
            .range
            .clone()
            .filter(|id| !self.is_reserved(*id) && !in_use.contains(id))
            .take(count)
            .collect();

        if ids.len() < count {
            warn!(requested = count, available = ids.len(), "VLAN pool exhausted");
            return Err(HypervisorError::PoolExhausted {
                requested: count,
                available: ids.len(),
            });
        }

        in_use.extend(ids.iter().copied());
        debug!(ids = ?ids, in_use = in_use.len(), "VLANs allocated");
        Ok(ids)
    }

    /// Return ids to the free set. Ids not currently in use are ignored.
    pub fn release(&self, ids: &[u16]) -> Result<()> {
        let mut in_use = self.lock()?;
        for id in ids {
            if !in_use.remove(id) {
                debug!(id, "VLAN already free");
            }
        }
        debug!(released = ?ids, in_use = in_use.len(), "VLANs released");
        Ok(())
    }

    /// Look up a reserved entry by network name.
    pub fn reserved_by_name(&self, name: &str) -> Option<&ReservedVlan> {
        self.reserved.iter().find(|r| r.name == name)
    }

    /// Reserved entries.
    pub fn reserved(&self) -> &[ReservedVlan] {
        &self.reserved
    }

    /// Number of ids that can still be allocated.
    pub fn available(&self) -> Result<usize> {
        let in_use = self.lock()?;
        Ok(self
            .range
            .clone()
            .filter(|id| !self.is_reserved(*id) && !in_use.contains(id))
            .count())
    }

    /// Ids currently allocated, ascending.
    pub fn in_use(&self) -> Result<Vec<u16>> {
        Ok(self.lock()?.iter().copied().collect())
    }
}
