//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::Hypervisor;
use crate::types::*;

const FIRST_CONSOLE_PORT: u16 = 5900;

/// Mock hypervisor backend.
///
/// Simulates a platform in memory without a real hypervisor. Lifecycle
/// operations run through [`plan_transition`], pass through the transient
/// state for `op_delay`, then settle. Useful for:
/// - Unit and integration testing
/// - Development without a hypervisor installed
/// - Multi-backend demos (register several with different names)
pub struct MockBackend {
    name: String,
    host: String,
    op_delay: Duration,
    isos: Vec<String>,
    networks: Vec<String>,
    healthy: AtomicBool,
    next_console_port: AtomicU16,
    vms: RwLock<HashMap<String, MockVm>>,
    disks: RwLock<HashSet<String>>,
    fail_deploy: RwLock<HashSet<String>>,
    fail_boot: RwLock<HashSet<String>>,
    hold_boot: RwLock<HashSet<String>>,
}

struct MockVm {
    vm: Vm,
    template: VmTemplate,
    saved_at: Option<DateTime<Utc>>,
    console_port: u16,
}

impl MockVm {
    fn descriptor(&self) -> Vm {
        let mut vm = self.vm.clone();
        vm.has_snapshot = self.saved_at.is_some();
        vm
    }
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        info!(backend = %name, "Creating mock hypervisor backend");
        Self {
            host: format!("{}-host", name),
            name,
            op_delay: Duration::ZERO,
            isos: Vec::new(),
            networks: Vec::new(),
            healthy: AtomicBool::new(true),
            next_console_port: AtomicU16::new(FIRST_CONSOLE_PORT),
            vms: RwLock::new(HashMap::new()),
            disks: RwLock::new(HashSet::new()),
            fail_deploy: RwLock::new(HashSet::new()),
            fail_boot: RwLock::new(HashSet::new()),
            hold_boot: RwLock::new(HashSet::new()),
        }
    }

    /// Set the physical host name reported on VMs.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Simulated platform latency for each lifecycle operation.
    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }

    /// ISO images this backend can attach.
    pub fn with_isos<I, S>(mut self, isos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.isos = isos.into_iter().map(Into::into).collect();
        self
    }

    /// Networks that exist on the platform without VLAN binding (uplinks).
    pub fn with_networks<I, S>(mut self, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.networks = networks.into_iter().map(Into::into).collect();
        self
    }

    /// Make the next deployments of `template_name` fail during provisioning.
    pub fn fail_deploy(&self, template_name: &str) -> Result<()> {
        self.fail_deploy
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .insert(template_name.to_string());
        Ok(())
    }

    /// Make VMs deployed from `template_name` come up in the failed state.
    pub fn fail_boot(&self, template_name: &str) -> Result<()> {
        self.fail_boot
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .insert(template_name.to_string());
        Ok(())
    }

    /// Leave VMs deployed from `template_name` in `starting`.
    pub fn hold_boot(&self, template_name: &str) -> Result<()> {
        self.hold_boot
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .insert(template_name.to_string());
        Ok(())
    }

    /// Flip the health check result. An unhealthy backend also refuses
    /// ISO and network listings.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Register a VM discovered on the platform outside of `deploy`.
    pub fn import_vm(&self, mut vm: Vm) -> Result<()> {
        vm.backend = self.name.clone();
        let template = VmTemplate {
            name: vm.name.clone(),
            networks: vm.networks.clone(),
            isolation_tag: vm.isolation_tag.clone(),
            ..Default::default()
        };
        let console_port = self.next_console_port.fetch_add(1, Ordering::SeqCst);
        self.write_vms()?.insert(
            vm.id.clone(),
            MockVm {
                vm,
                template,
                saved_at: None,
                console_port,
            },
        );
        Ok(())
    }

    /// Number of VMs held by this backend.
    pub fn vm_count(&self) -> usize {
        self.vms.read().map(|vms| vms.len()).unwrap_or(0)
    }

    fn read_vms(&self) -> Result<RwLockReadGuard<'_, HashMap<String, MockVm>>> {
        self.vms
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn write_vms(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, MockVm>>> {
        self.vms
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HypervisorError::Internal(format!("backend {} is unavailable", self.name)))
        }
    }

    fn flagged(set: &RwLock<HashSet<String>>, name: &str) -> Result<bool> {
        let set = set
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        Ok(set.contains(name))
    }

    /// Attach disks, networks and ISO for a freshly registered VM.
    fn attach(&self, template: &VmTemplate) -> Result<()> {
        if Self::flagged(&self.fail_deploy, &template.name)? {
            return Err(HypervisorError::provisioning(
                &template.name,
                "simulated platform failure",
            ));
        }

        for net in &template.networks {
            if net.vlan.is_none() && !self.networks.contains(&net.name) {
                return Err(HypervisorError::provisioning(
                    &template.name,
                    format!("network {} has no VLAN binding and is not an uplink", net.name),
                ));
            }
        }

        if let Some(iso) = &template.iso {
            if !self.isos.is_empty() && !self.isos.contains(iso) {
                return Err(HypervisorError::provisioning(
                    &template.name,
                    format!("ISO {} not found", iso),
                ));
            }
        }

        let mut disks = self
            .disks
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        for disk in &template.disks {
            disks.insert(disk.path.clone());
        }

        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new("mock")
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn load(&self, vm_id: &str) -> Result<Option<Vm>> {
        let vms = self.read_vms()?;
        Ok(vms.get(vm_id).map(MockVm::descriptor))
    }

    /// The mock has no privilege model; `_privileged` is accepted and ignored.
    #[instrument(skip(self, template), fields(backend = %self.name, template = %template.name))]
    async fn deploy(&self, template: &VmTemplate, _privileged: bool) -> Result<Vm> {
        info!("Deploying mock VM");

        if template.name.is_empty() {
            return Err(HypervisorError::provisioning("<unnamed>", "template has no name"));
        }

        tokio::time::sleep(self.op_delay).await;

        if let Err(e) = self.attach(template) {
            warn!(error = %e, "Provisioning failed");
            return Err(e);
        }

        let state = if Self::flagged(&self.fail_boot, &template.name)? {
            VmState::Failed
        } else if Self::flagged(&self.hold_boot, &template.name)? {
            VmState::Starting
        } else {
            VmState::Running
        };

        let vm_id = new_vm_id();
        let vm = MockVm {
            vm: Vm {
                id: vm_id.clone(),
                name: template.name.clone(),
                state,
                backend: self.name.clone(),
                host: self.host.clone(),
                isolation_tag: template.isolation_tag.clone(),
                has_snapshot: false,
                networks: template.networks.clone(),
            },
            template: template.clone(),
            saved_at: None,
            console_port: self.next_console_port.fetch_add(1, Ordering::SeqCst),
        };
        let descriptor = vm.descriptor();
        self.write_vms()?.insert(vm_id.clone(), vm);

        info!(vm_id = %vm_id, state = %state, "Mock VM deployed");
        Ok(descriptor)
    }

    #[instrument(skip(self), fields(backend = %self.name, vm_id = %vm_id, operation = %operation))]
    async fn change_state(&self, vm_id: &str, operation: VmOperation) -> Result<Vm> {
        let transition = {
            let mut vms = self.write_vms()?;
            let vm = vms
                .get_mut(vm_id)
                .ok_or_else(|| HypervisorError::VmNotFound(vm_id.to_string()))?;

            let transition =
                plan_transition(vm_id, vm.vm.state, operation, vm.saved_at.is_some())?;
            match transition {
                Transition::Unchanged => {
                    debug!(state = %vm.vm.state, "Already in requested state");
                    return Ok(vm.descriptor());
                }
                Transition::Move { via, .. } | Transition::Remove { via } => {
                    vm.vm.state = via;
                }
            }
            transition
        };

        // Release the lock while the "platform" works
        tokio::time::sleep(self.op_delay).await;

        let mut vms = self.write_vms()?;
        match transition {
            Transition::Remove { .. } => {
                let removed = vms
                    .remove(vm_id)
                    .ok_or_else(|| HypervisorError::VmNotFound(vm_id.to_string()))?;
                info!("Mock VM deleted");
                Ok(removed.descriptor())
            }
            Transition::Move { to, .. } => {
                let vm = vms
                    .get_mut(vm_id)
                    .ok_or_else(|| HypervisorError::VmNotFound(vm_id.to_string()))?;
                vm.vm.state = to;
                match operation {
                    VmOperation::Save => vm.saved_at = Some(Utc::now()),
                    VmOperation::Revert => {
                        debug!(saved_at = ?vm.saved_at, "Reverted to saved disks");
                    }
                    _ => {}
                }
                info!(state = %to, "Mock VM state changed");
                Ok(vm.descriptor())
            }
            Transition::Unchanged => Err(HypervisorError::Internal(
                "no-op transition reached the settle step".to_string(),
            )),
        }
    }

    #[instrument(skip(self), fields(backend = %self.name, vm_id = %vm_id))]
    async fn change_configuration(&self, vm_id: &str, change: VmChange) -> Result<Vm> {
        let mut vms = self.write_vms()?;
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| HypervisorError::VmNotFound(vm_id.to_string()))?;

        match change {
            VmChange::Iso(iso) => {
                if let Some(path) = &iso {
                    if !self.isos.is_empty() && !self.isos.contains(path) {
                        return Err(HypervisorError::InvalidConfig(format!("ISO {} not found", path)));
                    }
                }
                info!(iso = ?iso, "Changing CD-ROM media");
                vm.template.iso = iso;
            }
            VmChange::Network { index, name } => {
                let slot = vm.vm.networks.get_mut(index).ok_or_else(|| {
                    HypervisorError::InvalidConfig(format!("VM has no NIC at index {}", index))
                })?;
                *slot = NetworkRequest::new(name);
                vm.template.networks = vm.vm.networks.clone();
            }
            VmChange::Cpu(cpu) => {
                if vm.vm.state == VmState::Running {
                    return Err(HypervisorError::InvalidConfig(
                        "vCPU count can only change while the VM is stopped".to_string(),
                    ));
                }
                vm.template.cpu = cpu;
            }
            VmChange::Memory(memory_mib) => {
                if vm.vm.state == VmState::Running {
                    return Err(HypervisorError::InvalidConfig(
                        "memory can only change while the VM is stopped".to_string(),
                    ));
                }
                vm.template.memory_mib = memory_mib;
            }
        }

        Ok(vm.descriptor())
    }

    async fn display(&self, vm_id: &str) -> Result<ConsoleInfo> {
        let vms = self.read_vms()?;
        let vm = vms
            .get(vm_id)
            .ok_or_else(|| HypervisorError::VmNotFound(vm_id.to_string()))?;

        Ok(ConsoleInfo {
            vm_id: vm_id.to_string(),
            console_type: ConsoleType::Vnc,
            host: self.host.clone(),
            port: vm.console_port,
            ticket: Some(uuid::Uuid::new_v4().to_string()),
            websocket_path: Some(format!("/websockify?token={}", vm_id)),
        })
    }

    async fn find(&self, search: &str) -> Result<Vec<Vm>> {
        let vms = self.read_vms()?;
        let result: Vec<Vm> = vms
            .values()
            .map(MockVm::descriptor)
            .filter(|vm| vm.matches(search))
            .collect();

        debug!(backend = %self.name, count = result.len(), "Found VMs");
        Ok(result)
    }

    async fn iso_options(&self, _key: &str) -> Result<Vec<String>> {
        self.ensure_reachable()?;
        let mut isos = self.isos.clone();
        isos.sort();
        Ok(isos)
    }

    async fn net_options(&self, _key: &str) -> Result<Vec<String>> {
        self.ensure_reachable()?;
        let vms = self.read_vms()?;
        let mut names: BTreeSet<String> = self.networks.iter().cloned().collect();
        for vm in vms.values() {
            names.extend(vm.vm.networks.iter().map(ToString::to_string));
        }
        Ok(names.into_iter().collect())
    }

    #[instrument(skip(self, vm_ids), fields(backend = %self.name, tag = %tag, count = vm_ids.len()))]
    async fn set_affinity(&self, tag: &str, vm_ids: &[String], start: bool) -> Result<Vec<Vm>> {
        {
            let mut vms = self.write_vms()?;
            // Validate first so a bad id leaves the group untouched
            if let Some(missing) = vm_ids.iter().find(|id| !vms.contains_key(*id)) {
                return Err(HypervisorError::VmNotFound(missing.clone()));
            }
            for id in vm_ids {
                if let Some(vm) = vms.get_mut(id) {
                    vm.vm.isolation_tag = Some(tag.to_string());
                    vm.vm.host = self.host.clone();
                }
            }
        }
        info!("Affinity group applied");

        let mut result = Vec::with_capacity(vm_ids.len());
        for id in vm_ids {
            let vm = if start {
                self.start(id).await?
            } else {
                self.load(id)
                    .await?
                    .ok_or_else(|| HypervisorError::VmNotFound(id.clone()))?
            };
            result.push(vm);
        }
        Ok(result)
    }

    async fn reload_host(&self, host: &str) {
        if host == self.host {
            info!(backend = %self.name, host = %host, "Inventory reloaded");
        } else {
            debug!(backend = %self.name, host = %host, "Host not managed by this backend");
        }
    }

    async fn deploy_all(&self, target: &str) -> Result<Vec<Vm>> {
        let ids = tagged_ids(&self.find(target).await?, target);
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            result.push(self.start(&id).await?);
        }
        Ok(result)
    }

    async fn stop_all(&self, target: &str) -> Result<Vec<Vm>> {
        let ids = tagged_ids(&self.find(target).await?, target);
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            result.push(self.stop(&id).await?);
        }
        Ok(result)
    }

    async fn verify_disks(&self, template: &VmTemplate) -> Result<Vec<DiskStatus>> {
        let disks = self
            .disks
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        Ok(template
            .disks
            .iter()
            .map(|disk| DiskStatus {
                path: disk.path.clone(),
                ready: disks.contains(&disk.path),
            })
            .collect())
    }
}

fn tagged_ids(vms: &[Vm], tag: &str) -> Vec<String> {
    vms.iter()
        .filter(|vm| vm.isolation_tag.as_deref() == Some(tag))
        .map(|vm| vm.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn template(name: &str) -> VmTemplate {
        let mut t = VmTemplate::new(name).with_network("lan");
        t.networks[0].vlan = Some(100);
        t
    }

    #[tokio::test]
    async fn test_deploy_vm() {
        let backend = MockBackend::new("alpha");
        let vm = backend.deploy(&template("web"), false).await.unwrap();

        assert_eq!(vm.state, VmState::Running);
        assert_eq!(vm.backend, "alpha");
        assert!(backend.load(&vm.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_vm_lifecycle() {
        let backend = MockBackend::default();
        let vm = backend.deploy(&template("lifecycle"), false).await.unwrap();

        // Start is idempotent on a running VM
        let again = backend.start(&vm.id).await.unwrap();
        assert_eq!(again.state, VmState::Running);

        let stopped = backend.stop(&vm.id).await.unwrap();
        assert_eq!(stopped.state, VmState::Stopped);

        let saved = backend.save(&vm.id).await.unwrap();
        assert!(saved.has_snapshot);
        assert_eq!(saved.state, VmState::Stopped);

        backend.start(&vm.id).await.unwrap();
        let reverted = backend.revert(&vm.id).await.unwrap();
        assert_eq!(reverted.state, VmState::Stopped);

        backend.delete(&vm.id).await.unwrap();
        assert!(backend.load(&vm.id).await.unwrap().is_none());

        let err = backend.start(&vm.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failed_provisioning_leaves_no_vm() {
        let backend = MockBackend::default();
        let unbound = VmTemplate::new("orphan").with_network("nowhere");

        let err = backend.deploy(&unbound, false).await.unwrap_err();
        assert!(matches!(err, HypervisorError::Provisioning { .. }));
        assert_eq!(backend.vm_count(), 0);
    }

    #[tokio::test]
    async fn test_vm_invisible_until_provisioned() {
        let backend = Arc::new(MockBackend::default().with_op_delay(Duration::from_millis(100)));
        backend.fail_deploy("doomed").unwrap();

        let deploying = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.deploy(&template("doomed"), false).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.find("").await.unwrap().is_empty());
        assert!(deploying.await.unwrap().is_err());
        assert_eq!(backend.vm_count(), 0);
    }

    #[tokio::test]
    async fn test_held_boot_stays_starting() {
        let backend = MockBackend::default();
        backend.hold_boot("slow").unwrap();

        let vm = backend.deploy(&template("slow"), false).await.unwrap();
        assert_eq!(vm.state, VmState::Starting);
        assert!(backend.stop(&vm.id).await.is_err());
    }

    #[tokio::test]
    async fn test_uplink_network_needs_no_vlan() {
        let backend = MockBackend::default().with_networks(["uplink"]);
        let vm = backend
            .deploy(&VmTemplate::new("gw").with_network("uplink"), false)
            .await
            .unwrap();
        assert_eq!(vm.networks[0].vlan, None);
    }

    #[tokio::test]
    async fn test_delete_during_save_is_rejected() {
        let backend = Arc::new(MockBackend::default().with_op_delay(Duration::from_millis(200)));
        let vm = backend.deploy(&template("busy"), false).await.unwrap();

        let saver = {
            let backend = backend.clone();
            let id = vm.id.clone();
            tokio::spawn(async move { backend.save(&id).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = backend.delete(&vm.id).await.unwrap_err();
        assert!(matches!(
            err,
            HypervisorError::InvalidTransition {
                state: VmState::Saving,
                ..
            }
        ));

        let saved = saver.await.unwrap().unwrap();
        assert!(saved.has_snapshot);
    }

    #[tokio::test]
    async fn test_configuration_change_requires_stop() {
        let backend = MockBackend::default().with_isos(["debian.iso"]);
        let vm = backend.deploy(&template("sized"), false).await.unwrap();

        assert!(backend
            .change_configuration(&vm.id, VmChange::Memory(4096))
            .await
            .is_err());

        backend.stop(&vm.id).await.unwrap();
        backend
            .change_configuration(&vm.id, VmChange::Memory(4096))
            .await
            .unwrap();
        backend
            .change_configuration(&vm.id, VmChange::Iso(Some("debian.iso".into())))
            .await
            .unwrap();
        assert!(backend
            .change_configuration(&vm.id, VmChange::Iso(Some("missing.iso".into())))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bulk_stop_by_tag() {
        let backend = MockBackend::default();
        let a = backend
            .deploy(&template("a").with_isolation_tag("blue"), false)
            .await
            .unwrap();
        let b = backend
            .deploy(&template("b").with_isolation_tag("red"), false)
            .await
            .unwrap();

        let stopped = backend.stop_all("blue").await.unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].id, a.id);
        assert_eq!(
            backend.load(&b.id).await.unwrap().unwrap().state,
            VmState::Running
        );

        let started = backend.deploy_all("blue").await.unwrap();
        assert_eq!(started[0].state, VmState::Running);
    }
}
