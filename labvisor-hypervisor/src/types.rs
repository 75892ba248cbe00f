//! Type definitions for VMs, templates and the lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HypervisorError, Result};

// =============================================================================
// VM TEMPLATE
// =============================================================================

/// Deployable VM specification.
///
/// Templates are immutable once handed to the orchestrator; it deploys a
/// resolved copy with VLAN ids filled in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmTemplate {
    /// Human-readable name, also used as the VM display name
    pub name: String,
    /// Number of vCPUs
    pub cpu: u32,
    /// Memory size in MiB
    pub memory_mib: u64,
    /// Disk images
    pub disks: Vec<DiskTemplate>,
    /// Network attachments by logical name
    pub networks: Vec<NetworkRequest>,
    /// ISO image to attach, relative to the ISO store
    pub iso: Option<String>,
    /// Isolation/affinity tag
    pub isolation_tag: Option<String>,
    /// Name of the backend that should host this VM
    pub placement: Option<String>,
}

impl Default for VmTemplate {
    fn default() -> Self {
        Self {
            name: String::new(),
            cpu: 1,
            memory_mib: 1024,
            disks: Vec::new(),
            networks: Vec::new(),
            iso: None,
            isolation_tag: None,
            placement: None,
        }
    }
}

impl VmTemplate {
    /// Create a template with default sizing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the number of vCPUs.
    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    /// Set the memory size in MiB.
    pub fn with_memory(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    /// Add a disk.
    pub fn with_disk(mut self, disk: DiskTemplate) -> Self {
        self.disks.push(disk);
        self
    }

    /// Attach a logical network.
    pub fn with_network(mut self, name: impl Into<String>) -> Self {
        self.networks.push(NetworkRequest::new(name));
        self
    }

    /// Attach an ISO image.
    pub fn with_iso(mut self, iso: impl Into<String>) -> Self {
        self.iso = Some(iso.into());
        self
    }

    /// Set the isolation tag.
    pub fn with_isolation_tag(mut self, tag: impl Into<String>) -> Self {
        self.isolation_tag = Some(tag.into());
        self
    }

    /// Pin the template to a named backend.
    pub fn with_placement(mut self, backend: impl Into<String>) -> Self {
        self.placement = Some(backend.into());
        self
    }
}

/// Disk image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskTemplate {
    /// Path relative to the disk store
    pub path: String,
    /// Size in GiB
    pub size_gib: u64,
    /// Image format
    #[serde(default)]
    pub format: DiskFormat,
    /// Backing image for copy-on-write disks
    #[serde(default)]
    pub backing: Option<String>,
    /// Remove the image when the deployment is torn down
    #[serde(default)]
    pub delete_on_teardown: bool,
}

impl DiskTemplate {
    /// Create a disk reference.
    pub fn new(path: impl Into<String>, size_gib: u64) -> Self {
        Self {
            path: path.into(),
            size_gib,
            format: DiskFormat::default(),
            backing: None,
            delete_on_teardown: false,
        }
    }

    /// Mark the disk for deletion on teardown.
    pub fn ephemeral(mut self) -> Self {
        self.delete_on_teardown = true;
        self
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_gib * 1024 * 1024 * 1024
    }
}

/// Disk format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Qcow2,
    Raw,
    Vmdk,
}

impl DiskFormat {
    /// Get the format string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
        }
    }
}

/// A network attachment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Logical network name
    pub name: String,
    /// VLAN id bound by the orchestrator (None for pass-through networks)
    #[serde(default)]
    pub vlan: Option<u16>,
}

impl NetworkRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vlan: None,
        }
    }
}

impl fmt::Display for NetworkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vlan {
            Some(vlan) => write!(f, "{}#{}", self.name, vlan),
            None => f.write_str(&self.name),
        }
    }
}

// =============================================================================
// VM STATUS
// =============================================================================

/// A VM as reported by the backend that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    /// Backend-assigned identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Current run state
    pub state: VmState,
    /// Name of the owning backend
    pub backend: String,
    /// Physical host the VM runs on
    pub host: String,
    /// Isolation tag the VM was deployed under
    pub isolation_tag: Option<String>,
    /// A saved snapshot exists for revert
    pub has_snapshot: bool,
    /// Network bindings
    pub networks: Vec<NetworkRequest>,
}

impl Vm {
    /// True if the name or tag contains `search` (case-insensitive).
    /// An empty search matches every VM.
    pub fn matches(&self, search: &str) -> bool {
        if search.is_empty() {
            return true;
        }
        let needle = search.to_lowercase();
        self.name.to_lowercase().contains(&needle)
            || self
                .isolation_tag
                .as_deref()
                .is_some_and(|tag| tag.to_lowercase().contains(&needle))
    }
}

/// VM run state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    #[default]
    Initialized,
    Stopped,
    Running,
    Starting,
    Stopping,
    Saving,
    Reverting,
    Deleting,
    Unavailable,
    Failed,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Initialized => "initialized",
            VmState::Stopped => "stopped",
            VmState::Running => "running",
            VmState::Starting => "starting",
            VmState::Stopping => "stopping",
            VmState::Saving => "saving",
            VmState::Reverting => "reverting",
            VmState::Deleting => "deleting",
            VmState::Unavailable => "unavailable",
            VmState::Failed => "failed",
        }
    }

    /// States a VM passes through while an operation is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VmState::Starting
                | VmState::Stopping
                | VmState::Saving
                | VmState::Reverting
                | VmState::Deleting
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle operation for `change_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmOperation {
    Start,
    Stop,
    Save,
    Revert,
    Delete,
}

impl VmOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmOperation::Start => "start",
            VmOperation::Stop => "stop",
            VmOperation::Save => "save",
            VmOperation::Revert => "revert",
            VmOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for VmOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of planning a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already in the requested state; return the current descriptor.
    Unchanged,
    /// Pass through `via` while the platform works, then settle in `to`.
    Move { via: VmState, to: VmState },
    /// Pass through `via`, then the VM no longer exists.
    Remove { via: VmState },
}

/// Decide what `operation` does to a VM in `state`.
///
/// Every backend adapter runs its lifecycle through this table so the
/// contract behaves the same regardless of platform.
pub fn plan_transition(
    vm_id: &str,
    state: VmState,
    operation: VmOperation,
    has_snapshot: bool,
) -> Result<Transition> {
    use VmOperation::*;
    use VmState::*;

    let invalid = || HypervisorError::InvalidTransition {
        vm_id: vm_id.to_string(),
        state,
        operation,
    };

    if state.is_transient() || state == Unavailable {
        return Err(invalid());
    }

    let transition = match (state, operation) {
        (Running, Start) | (Stopped, Stop) | (Initialized, Stop) => Transition::Unchanged,
        (Stopped | Initialized | Failed, Start) => Transition::Move {
            via: Starting,
            to: Running,
        },
        (Running | Failed, Stop) => Transition::Move {
            via: Stopping,
            to: Stopped,
        },
        (Running | Stopped, Save) => Transition::Move {
            via: Saving,
            to: Stopped,
        },
        (Running | Stopped | Failed, Revert) if has_snapshot => Transition::Move {
            via: Reverting,
            to: Stopped,
        },
        (_, Delete) => Transition::Remove { via: Deleting },
        _ => return Err(invalid()),
    };

    Ok(transition)
}

// =============================================================================
// CONFIGURATION CHANGES & CONSOLE
// =============================================================================

/// A configuration change applied to an existing VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmChange {
    /// Mount an ISO (Some) or eject the current media (None).
    Iso(Option<String>),
    /// Rebind a NIC to another network.
    Network { index: usize, name: String },
    /// Change vCPU count (VM must not be running).
    Cpu(u32),
    /// Change memory in MiB (VM must not be running).
    Memory(u64),
}

/// Console connection information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleInfo {
    /// VM the console belongs to
    pub vm_id: String,
    /// Console type
    pub console_type: ConsoleType,
    /// Host to connect to
    pub host: String,
    /// Port to connect to
    pub port: u16,
    /// One-time ticket (if required)
    pub ticket: Option<String>,
    /// WebSocket path (for noVNC)
    pub websocket_path: Option<String>,
}

/// Console type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleType {
    Vnc,
    Spice,
}

/// Result of a backend-side disk verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskStatus {
    /// Disk path
    pub path: String,
    /// The image exists with matching size and format
    pub ready: bool,
}

/// Generate a fresh VM id.
pub fn new_vm_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_on_running_is_unchanged() {
        let plan = plan_transition("vm-1", VmState::Running, VmOperation::Start, false).unwrap();
        assert_eq!(plan, Transition::Unchanged);
    }

    #[test]
    fn delete_mid_save_is_rejected() {
        let err = plan_transition("vm-1", VmState::Saving, VmOperation::Delete, true).unwrap_err();
        assert!(matches!(
            err,
            HypervisorError::InvalidTransition {
                state: VmState::Saving,
                operation: VmOperation::Delete,
                ..
            }
        ));
    }

    #[test]
    fn revert_requires_snapshot() {
        assert!(plan_transition("vm-1", VmState::Stopped, VmOperation::Revert, false).is_err());
        let plan = plan_transition("vm-1", VmState::Stopped, VmOperation::Revert, true).unwrap();
        assert_eq!(
            plan,
            Transition::Move {
                via: VmState::Reverting,
                to: VmState::Stopped
            }
        );
    }

    #[test]
    fn unavailable_is_absorbing() {
        for op in [
            VmOperation::Start,
            VmOperation::Stop,
            VmOperation::Save,
            VmOperation::Revert,
            VmOperation::Delete,
        ] {
            assert!(plan_transition("vm-1", VmState::Unavailable, op, true).is_err());
        }
    }

    #[test]
    fn save_settles_stopped() {
        let plan = plan_transition("vm-1", VmState::Running, VmOperation::Save, false).unwrap();
        assert_eq!(
            plan,
            Transition::Move {
                via: VmState::Saving,
                to: VmState::Stopped
            }
        );
    }

    #[test]
    fn vm_matches_name_or_tag() {
        let vm = Vm {
            id: "1".into(),
            name: "Router-A".into(),
            state: VmState::Running,
            backend: "mock".into(),
            host: "host-1".into(),
            isolation_tag: Some("team-blue".into()),
            has_snapshot: false,
            networks: Vec::new(),
        };
        assert!(vm.matches("router"));
        assert!(vm.matches("BLUE"));
        assert!(vm.matches(""));
        assert!(!vm.matches("red"));
    }

    #[test]
    fn network_request_display() {
        let mut net = NetworkRequest::new("lan");
        assert_eq!(net.to_string(), "lan");
        net.vlan = Some(100);
        assert_eq!(net.to_string(), "lan#100");
    }
}
