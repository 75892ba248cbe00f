//! Core hypervisor lifecycle contract.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Core hypervisor abstraction trait.
///
/// Every backend adapter implements this trait, and so does the
/// [`Dispatcher`](crate::Dispatcher), so callers never need to know which
/// platform owns a VM.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Identity & Health
    // =========================================================================

    /// Name of this backend, reported as `Vm::backend`.
    fn name(&self) -> &str;

    /// Check if the backend connection is healthy.
    async fn health_check(&self) -> Result<bool>;

    // =========================================================================
    // VM Lifecycle
    // =========================================================================

    /// Ownership probe: the VM if this backend owns `vm_id`, otherwise None.
    async fn load(&self, vm_id: &str) -> Result<Option<Vm>>;

    /// Provision a VM from a resolved template.
    ///
    /// On failure the adapter removes whatever it created, so no
    /// half-deployed VM is visible to later calls.
    async fn deploy(&self, template: &VmTemplate, privileged: bool) -> Result<Vm>;

    /// Drive a lifecycle transition on an existing VM.
    async fn change_state(&self, vm_id: &str, operation: VmOperation) -> Result<Vm>;

    /// Start a VM.
    async fn start(&self, vm_id: &str) -> Result<Vm> {
        self.change_state(vm_id, VmOperation::Start).await
    }

    /// Stop a VM.
    async fn stop(&self, vm_id: &str) -> Result<Vm> {
        self.change_state(vm_id, VmOperation::Stop).await
    }

    /// Save (snapshot) a VM's disks.
    async fn save(&self, vm_id: &str) -> Result<Vm> {
        self.change_state(vm_id, VmOperation::Save).await
    }

    /// Revert a VM to its last save.
    async fn revert(&self, vm_id: &str) -> Result<Vm> {
        self.change_state(vm_id, VmOperation::Revert).await
    }

    /// Delete a VM. Returns the last descriptor before removal.
    async fn delete(&self, vm_id: &str) -> Result<Vm> {
        self.change_state(vm_id, VmOperation::Delete).await
    }

    /// Apply a configuration change to an existing VM.
    async fn change_configuration(&self, vm_id: &str, change: VmChange) -> Result<Vm>;

    /// Get console connection information.
    async fn display(&self, vm_id: &str) -> Result<ConsoleInfo>;

    // =========================================================================
    // Queries
    // =========================================================================

    /// All VMs whose name or isolation tag matches `search`.
    async fn find(&self, search: &str) -> Result<Vec<Vm>>;

    /// ISO images visible to the backend that owns (or would own) `key`.
    async fn iso_options(&self, key: &str) -> Result<Vec<String>>;

    /// Network names visible to the backend that owns (or would own) `key`.
    async fn net_options(&self, key: &str) -> Result<Vec<String>>;

    // =========================================================================
    // Grouping & Host Maintenance
    // =========================================================================

    /// Group `vm_ids` under `tag`, optionally powering them on afterwards.
    async fn set_affinity(&self, tag: &str, vm_ids: &[String], start: bool) -> Result<Vec<Vm>>;

    /// Refresh cached inventory for one physical host. Best effort.
    async fn reload_host(&self, host: &str);

    // =========================================================================
    // Backend-scoped Bulk Operations
    // =========================================================================

    /// Start every VM carrying the isolation tag `target`.
    async fn deploy_all(&self, target: &str) -> Result<Vec<Vm>>;

    /// Stop every VM carrying the isolation tag `target`.
    async fn stop_all(&self, target: &str) -> Result<Vec<Vm>>;

    /// Report whether the template's disks are present on this backend.
    async fn verify_disks(&self, template: &VmTemplate) -> Result<Vec<DiskStatus>>;
}
