//! Deployment orchestrator.
//!
//! Deploys a [`DeploymentContext`] in four steps:
//!
//! 1. Bind networks: one pool VLAN per distinct isolated network name across
//!    the whole context, reserved names to their reserved id, uplink names
//!    passed through.
//! 2. Verify or create each member's disks in the disk store.
//! 3. Deploy every member through the hypervisor, concurrently.
//! 4. Optionally apply affinity and wait for every member to run.
//!
//! There is no deployment-wide rollback. A member that fails is reported in
//! [`Deployment::failures`] and its siblings stay up for inspection; cleanup
//! is the caller's call through [`Orchestrator::delete_all`].

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::network::{NetworkClassifier, NetworkKind};
use crate::storage::DiskStore;
use crate::traits::Hypervisor;
use crate::types::{DiskTemplate, Vm, VmState, VmTemplate};
use crate::vlan::VlanPool;

/// How long `deploy` waits for members to reach `running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    /// Delay between state polls in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound on the whole wait in seconds
    pub timeout_secs: u64,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            timeout_secs: 300,
        }
    }
}

impl WaitPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A set of templates deployed and torn down together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentContext {
    /// Deployment name
    pub name: String,
    /// Isolation tag applied to every member
    pub isolation_tag: String,
    /// Group members with `set_affinity` after deployment
    #[serde(default)]
    pub affinity: bool,
    /// Deploy members with elevated privileges
    #[serde(default)]
    pub privileged: bool,
    /// Member templates, in order
    pub templates: Vec<VmTemplate>,
}

impl DeploymentContext {
    pub fn new(name: impl Into<String>, isolation_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            isolation_tag: isolation_tag.into(),
            affinity: false,
            privileged: false,
            templates: Vec::new(),
        }
    }

    /// Add a member template.
    pub fn with_template(mut self, template: VmTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Request affinity grouping.
    pub fn with_affinity(mut self) -> Self {
        self.affinity = true;
        self
    }
}

/// A member that did not come up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberFailure {
    /// Template name
    pub template: String,
    /// VM id, if the VM was created before the failure
    pub vm_id: Option<String>,
    /// What went wrong
    pub reason: String,
}

/// A deployed member VM and the resolved template it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployedMember {
    pub template: VmTemplate,
    pub vm: Vm,
}

/// Outcome of deploying a context; the handle for teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub isolation_tag: String,
    /// Pool VLANs held by this deployment, by network name
    pub vlans: BTreeMap<String, u16>,
    /// Resolved templates of every member, deployed or not
    pub templates: Vec<VmTemplate>,
    /// VMs that exist on a backend
    pub members: Vec<DeployedMember>,
    /// Members that failed
    pub failures: Vec<MemberFailure>,
    /// Non-fatal problems (e.g. affinity could not be applied)
    pub warnings: Vec<String>,
}

impl Deployment {
    /// True if every member deployed (and, when waited on, is running).
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn a partial deployment into an error naming the first failed member.
    pub fn ensure_complete(&self) -> Result<()> {
        match self.failures.first() {
            None => Ok(()),
            Some(failure) => Err(HypervisorError::provisioning(
                &failure.template,
                failure.reason.clone(),
            )),
        }
    }

    /// Ids of the VMs that exist.
    pub fn vm_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.vm.id.clone()).collect()
    }

    /// Pool VLAN ids held by this deployment.
    pub fn allocated_vlans(&self) -> Vec<u16> {
        self.vlans.values().copied().collect()
    }
}

/// What `delete_all` did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeardownReport {
    /// VMs removed (or already gone)
    pub deleted_vms: Vec<String>,
    /// VMs that could not be removed: (vm id, reason)
    pub vm_errors: Vec<(String, String)>,
    /// Disks removed
    pub deleted_disks: Vec<String>,
    /// Disks that could not be removed or were skipped: (path, reason)
    pub disk_errors: Vec<(String, String)>,
    /// VLANs returned to the pool
    pub released_vlans: Vec<u16>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.vm_errors.is_empty() && self.disk_errors.is_empty()
    }
}

/// Sequences disk, VLAN and VM work for deployment contexts.
pub struct Orchestrator {
    hypervisor: Arc<dyn Hypervisor>,
    vlans: Arc<VlanPool>,
    disks: Arc<dyn DiskStore>,
    classifier: NetworkClassifier,
    wait: WaitPolicy,
}

impl Orchestrator {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        vlans: Arc<VlanPool>,
        disks: Arc<dyn DiskStore>,
        classifier: NetworkClassifier,
    ) -> Self {
        Self {
            hypervisor,
            vlans,
            disks,
            classifier,
            wait: WaitPolicy::default(),
        }
    }

    /// Override the default wait policy.
    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// The hypervisor this orchestrator deploys through.
    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    /// The shared VLAN pool.
    pub fn vlan_pool(&self) -> &Arc<VlanPool> {
        &self.vlans
    }

    /// Step 1: allocate VLANs and produce resolved member templates.
    ///
    /// Either every isolated network gets an id or nothing is claimed.
    pub fn bind_networks(
        &self,
        context: &DeploymentContext,
    ) -> Result<(BTreeMap<String, u16>, Vec<VmTemplate>)> {
        let mut kinds: Vec<(String, NetworkKind)> = Vec::new();
        for template in &context.templates {
            for net in &template.networks {
                if !kinds.iter().any(|(name, _)| name == &net.name) {
                    let kind = self.classifier.classify(&net.name, &self.vlans);
                    kinds.push((net.name.clone(), kind));
                }
            }
        }

        let isolated: Vec<&str> = kinds
            .iter()
            .filter(|(_, kind)| *kind == NetworkKind::Isolated)
            .map(|(name, _)| name.as_str())
            .collect();

        let ids = self.vlans.allocate(isolated.len())?;
        let vlans: BTreeMap<String, u16> = isolated
            .iter()
            .map(|name| name.to_string())
            .zip(ids)
            .collect();

        let resolved = context
            .templates
            .iter()
            .map(|template| {
                let mut template = template.clone();
                template.isolation_tag = Some(context.isolation_tag.clone());
                for net in &mut template.networks {
                    net.vlan = match kinds.iter().find(|(name, _)| name == &net.name) {
                        Some((_, NetworkKind::Reserved(id))) => Some(*id),
                        Some((_, NetworkKind::Isolated)) => vlans.get(&net.name).copied(),
                        _ => None,
                    };
                }
                template
            })
            .collect();

        Ok((vlans, resolved))
    }

    /// Deploy every member of `context`.
    ///
    /// Fails as a whole only before any VM exists: VLAN exhaustion or
    /// cancellation ahead of step 2. After that the returned [`Deployment`]
    /// lists per-member failures and leaves deployed siblings running.
    #[instrument(skip(self, context, cancel), fields(deployment = %context.name, tag = %context.isolation_tag, members = context.templates.len()))]
    pub async fn deploy(
        &self,
        context: DeploymentContext,
        wait: bool,
        cancel: &CancellationToken,
    ) -> Result<Deployment> {
        if cancel.is_cancelled() {
            return Err(HypervisorError::Cancelled(context.name));
        }

        let (vlans, templates) = self.bind_networks(&context)?;
        info!(vlans = ?vlans, "Networks bound");

        if cancel.is_cancelled() {
            let ids: Vec<u16> = vlans.values().copied().collect();
            self.vlans.release(&ids)?;
            return Err(HypervisorError::Cancelled(context.name));
        }

        let disk_errors = self.prepare_disks(&templates).await;

        let privileged = context.privileged;
        let outcomes = join_all(
            templates
                .iter()
                .map(|template| self.deploy_member(template, &disk_errors, privileged, cancel)),
        )
        .await;

        let mut deployment = Deployment {
            name: context.name,
            isolation_tag: context.isolation_tag,
            vlans,
            templates: Vec::with_capacity(templates.len()),
            members: Vec::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
        };

        for (template, outcome) in templates.into_iter().zip(outcomes) {
            match outcome {
                Ok(vm) => deployment.members.push(DeployedMember {
                    template: template.clone(),
                    vm,
                }),
                Err(e) => {
                    warn!(template = %template.name, error = %e, "Member failed to deploy");
                    deployment.failures.push(MemberFailure {
                        template: template.name.clone(),
                        vm_id: None,
                        reason: e.to_string(),
                    });
                }
            }
            deployment.templates.push(template);
        }

        if context.affinity && !deployment.members.is_empty() && !cancel.is_cancelled() {
            self.apply_affinity(&mut deployment).await;
        }

        if wait && !deployment.members.is_empty() {
            self.wait_for_members(&mut deployment, cancel).await;
        }

        info!(
            deployed = deployment.members.len(),
            failed = deployment.failures.len(),
            "Deployment finished"
        );
        Ok(deployment)
    }

    /// Step 2: verify or create every distinct disk of the context once.
    ///
    /// Returns the failed disks with their reasons; members referencing one
    /// of them are not deployed.
    async fn prepare_disks(&self, templates: &[VmTemplate]) -> Vec<(DiskTemplate, String)> {
        let mut distinct: Vec<&DiskTemplate> = Vec::new();
        for disk in templates.iter().flat_map(|t| &t.disks) {
            if !distinct.iter().any(|d| same_image(d, disk)) {
                distinct.push(disk);
            }
        }

        let outcomes = join_all(distinct.iter().map(|disk| self.disks.ensure_disk(disk))).await;

        let mut failed = Vec::new();
        for (disk, outcome) in distinct.into_iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => debug!(disk = %disk.path, outcome = ?outcome, "Disk ready"),
                Err(e) => {
                    warn!(disk = %disk.path, error = %e, "Disk not ready");
                    failed.push((disk.clone(), e.to_string()));
                }
            }
        }
        failed
    }

    /// Step 3 for one member.
    async fn deploy_member(
        &self,
        template: &VmTemplate,
        disk_errors: &[(DiskTemplate, String)],
        privileged: bool,
        cancel: &CancellationToken,
    ) -> Result<Vm> {
        for disk in &template.disks {
            if let Some((_, reason)) = disk_errors.iter().find(|(d, _)| same_image(d, disk)) {
                return Err(HypervisorError::provisioning(
                    &template.name,
                    format!("disk {}: {}", disk.path, reason),
                ));
            }
        }

        if cancel.is_cancelled() {
            return Err(HypervisorError::Cancelled(template.name.clone()));
        }

        self.hypervisor.deploy(template, privileged).await
    }

    async fn apply_affinity(&self, deployment: &mut Deployment) {
        let ids = deployment.vm_ids();
        match self
            .hypervisor
            .set_affinity(&deployment.isolation_tag, &ids, true)
            .await
        {
            Ok(vms) => {
                for vm in vms {
                    if let Some(member) = deployment.members.iter_mut().find(|m| m.vm.id == vm.id) {
                        member.vm = vm;
                    }
                }
                debug!("Affinity applied");
            }
            Err(e) => {
                warn!(error = %e, "Failed to apply affinity");
                deployment.warnings.push(format!("affinity not applied: {}", e));
            }
        }
    }

    /// Step 4: poll until every member runs, one fails, or the policy expires.
    ///
    /// Members still pending when a sibling fails are left as they are.
    async fn wait_for_members(&self, deployment: &mut Deployment, cancel: &CancellationToken) {
        let deadline = tokio::time::Instant::now() + self.wait.timeout();
        let mut pending: Vec<usize> = (0..deployment.members.len()).collect();

        loop {
            let probes = pending
                .iter()
                .map(|i| self.hypervisor.load(&deployment.members[*i].vm.id));
            let results = join_all(probes).await;

            let failures_before = deployment.failures.len();
            let mut still_pending = Vec::new();
            for (index, result) in pending.iter().copied().zip(results) {
                let member = &mut deployment.members[index];
                match result {
                    Ok(Some(vm)) if vm.state == VmState::Running => member.vm = vm,
                    Ok(Some(vm)) if vm.state == VmState::Failed => {
                        warn!(template = %member.template.name, vm_id = %vm.id, "Member failed to start");
                        deployment.failures.push(MemberFailure {
                            template: member.template.name.clone(),
                            vm_id: Some(vm.id.clone()),
                            reason: "VM reported failed state".to_string(),
                        });
                        member.vm = vm;
                    }
                    Ok(Some(vm)) => {
                        member.vm = vm;
                        still_pending.push(index);
                    }
                    Ok(None) => deployment.failures.push(MemberFailure {
                        template: member.template.name.clone(),
                        vm_id: Some(member.vm.id.clone()),
                        reason: "VM disappeared while waiting".to_string(),
                    }),
                    Err(e) => {
                        debug!(vm_id = %member.vm.id, error = %e, "State poll failed");
                        still_pending.push(index);
                    }
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                return;
            }
            if deployment.failures.len() > failures_before {
                info!(pending = pending.len(), "Member failed, no longer waiting");
                return;
            }
            if cancel.is_cancelled() {
                info!(pending = pending.len(), "Wait cancelled");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                for index in pending {
                    let member = &deployment.members[index];
                    deployment.failures.push(MemberFailure {
                        template: member.template.name.clone(),
                        vm_id: Some(member.vm.id.clone()),
                        reason: format!(
                            "not running after {}s (state {})",
                            self.wait.timeout_secs, member.vm.state
                        ),
                    });
                }
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.wait.poll_interval()) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Tear down a deployment.
    ///
    /// VMs are deleted, disks marked `delete_on_teardown` are removed, and
    /// every VLAN the deployment holds goes back to the pool. VM and disk
    /// failures are logged and reported; they never keep VLANs from being
    /// released.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.name, tag = %deployment.isolation_tag))]
    pub async fn delete_all(&self, deployment: Deployment) -> Result<TeardownReport> {
        let mut report = TeardownReport::default();

        let deletions = join_all(
            deployment
                .members
                .iter()
                .map(|member| self.hypervisor.delete(&member.vm.id)),
        )
        .await;

        let mut busy_templates = Vec::new();
        for (member, result) in deployment.members.iter().zip(deletions) {
            match result {
                Ok(_) => report.deleted_vms.push(member.vm.id.clone()),
                Err(e) if e.is_not_found() => {
                    debug!(vm_id = %member.vm.id, "VM already gone");
                    report.deleted_vms.push(member.vm.id.clone());
                }
                Err(e) => {
                    error!(vm_id = %member.vm.id, error = %e, "Failed to delete VM");
                    report.vm_errors.push((member.vm.id.clone(), e.to_string()));
                    busy_templates.push(member.template.name.clone());
                }
            }
        }

        for template in &deployment.templates {
            for disk in template.disks.iter().filter(|d| d.delete_on_teardown) {
                if busy_templates.contains(&template.name) {
                    report
                        .disk_errors
                        .push((disk.path.clone(), "VM still exists".to_string()));
                    continue;
                }
                match self.disks.delete_disk(disk).await {
                    Ok(()) => report.deleted_disks.push(disk.path.clone()),
                    Err(e) => {
                        error!(disk = %disk.path, error = %e, "Failed to delete disk");
                        report.disk_errors.push((disk.path.clone(), e.to_string()));
                    }
                }
            }
        }

        let ids = deployment.allocated_vlans();
        self.vlans.release(&ids)?;
        report.released_vlans = ids;

        info!(
            vms = report.deleted_vms.len(),
            disks = report.deleted_disks.len(),
            vlans = report.released_vlans.len(),
            clean = report.is_clean(),
            "Deployment torn down"
        );
        Ok(report)
    }
}

/// Two disk references naming the same image with the same shape.
fn same_image(a: &DiskTemplate, b: &DiskTemplate) -> bool {
    a.path == b.path && a.size_gib == b.size_gib && a.format == b.format && a.backing == b.backing
}
