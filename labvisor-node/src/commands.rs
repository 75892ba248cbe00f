//! Operator subcommands.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use labvisor_common::TimedOperation;
use labvisor_hypervisor::{
    Deployment, DeploymentContext, HypervisorServiceConfiguration, Orchestrator, ReservedVlan,
    TeardownReport, VlanPool, Vm,
};

use crate::config::Config;
use crate::server::{build_hypervisor, build_orchestrator, cancel_on_ctrl_c};

/// Result of the `deploy` subcommand, printed as JSON.
#[derive(Debug, Serialize)]
pub struct DeployOutcome {
    pub deployment: Deployment,
    /// VMs carrying the deployment's isolation tag while it was up
    pub inventory: Vec<Vm>,
    /// VLAN pool while the deployment was up
    pub vlans: VlanSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown: Option<TeardownReport>,
}

/// VLAN pool usage.
#[derive(Debug, Serialize)]
pub struct VlanSummary {
    pub start: u16,
    pub end: u16,
    pub available: usize,
    pub in_use: Vec<u16>,
    pub reserved: Vec<ReservedVlan>,
}

impl VlanSummary {
    pub fn of(config: &HypervisorServiceConfiguration, pool: &VlanPool) -> Result<Self> {
        Ok(Self {
            start: config.vlan.start,
            end: config.vlan.end,
            available: pool.available()?,
            in_use: pool.in_use()?,
            reserved: pool.reserved().to_vec(),
        })
    }
}

/// Read a deployment context from a YAML file.
pub fn load_context(path: &Path) -> Result<DeploymentContext> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read deployment file: {}", path.display()))?;
    let context: DeploymentContext = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse deployment file: {}", path.display()))?;

    if context.templates.is_empty() {
        return Err(anyhow::anyhow!("Deployment {} has no templates", context.name));
    }
    Ok(context)
}

/// Deploy the context in `file` through `orchestrator`, logging failed members.
pub async fn deploy_context(
    orchestrator: &Orchestrator,
    file: &Path,
    wait: bool,
    cancel: &CancellationToken,
) -> Result<Deployment> {
    let context = load_context(file)?;

    let op = TimedOperation::start(format!("deploy {}", context.name));
    let deployment = orchestrator
        .deploy(context, wait, cancel)
        .await
        .context("Deployment failed")?;
    op.finish();

    for failure in &deployment.failures {
        warn!(template = %failure.template, reason = %failure.reason, "Member failed");
    }
    Ok(deployment)
}

/// Deploy the context in `file`, optionally waiting and tearing down again.
pub async fn deploy(config: &Config, file: &Path, wait: bool, teardown: bool) -> Result<DeployOutcome> {
    let hypervisor = build_hypervisor(&config.hypervisor)?;
    let orchestrator = build_orchestrator(&config.hypervisor, hypervisor)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let deployment = deploy_context(&orchestrator, file, wait, &cancel).await?;

    let inventory = orchestrator
        .hypervisor()
        .find(&deployment.isolation_tag)
        .await
        .with_context(|| format!("Failed to list VMs tagged {}", deployment.isolation_tag))?;
    let vlans = VlanSummary::of(&config.hypervisor, orchestrator.vlan_pool())?;

    let teardown = if teardown {
        let report = orchestrator
            .delete_all(deployment.clone())
            .await
            .context("Teardown failed")?;
        info!(clean = report.is_clean(), "Teardown finished");
        Some(report)
    } else {
        None
    };

    Ok(DeployOutcome {
        deployment,
        inventory,
        vlans,
        teardown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use labvisor_hypervisor::VlanConfiguration;
    use std::io::Write;

    fn config(disk_store: &Path) -> Config {
        let mut config = Config::default();
        config.hypervisor.vlan = VlanConfiguration::new(100, 104).with_reserved(102, "mgmt", true);
        config.hypervisor.storage.disk_store = disk_store.to_string_lossy().to_string();
        config
    }

    fn context_file(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    const LAB: &str = r#"
name: lab
isolation_tag: team-1
templates:
  - name: router
    networks:
      - name: lan
      - name: mgmt
    disks:
      - path: lab/router.qcow2
        size_gib: 1
        delete_on_teardown: true
  - name: client
    networks:
      - name: lan
"#;

    #[tokio::test]
    async fn deploys_and_tears_down_from_yaml() {
        let disks = tempfile::tempdir().unwrap();
        let file = context_file(LAB);

        let outcome = deploy(&config(disks.path()), file.path(), true, true)
            .await
            .unwrap();

        assert!(outcome.deployment.is_complete());
        assert_eq!(outcome.deployment.vlans.get("lan"), Some(&100));
        assert_eq!(outcome.deployment.members.len(), 2);

        // Observed while the deployment was up.
        assert_eq!(outcome.inventory.len(), 2);
        assert!(outcome
            .inventory
            .iter()
            .all(|vm| vm.isolation_tag.as_deref() == Some("team-1")));
        assert_eq!(outcome.vlans.in_use, vec![100]);
        assert_eq!(outcome.vlans.available, 3);

        let report = outcome.teardown.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.released_vlans, vec![100]);
        assert!(!disks.path().join("lab/router.qcow2").exists());
    }

    #[test]
    fn empty_context_is_rejected() {
        let file = context_file("name: empty\nisolation_tag: x\ntemplates: []\n");
        assert!(load_context(file.path()).is_err());
    }

    #[test]
    fn vlan_summary_excludes_reserved() {
        let disks = tempfile::tempdir().unwrap();
        let config = config(disks.path());
        let pool = config.hypervisor.vlan_pool().unwrap();
        pool.allocate(2).unwrap();

        let summary = VlanSummary::of(&config.hypervisor, &pool).unwrap();
        assert_eq!(summary.available, 2);
        assert_eq!(summary.in_use, vec![100, 101]);
        assert_eq!(summary.reserved[0].name, "mgmt");
    }
}
