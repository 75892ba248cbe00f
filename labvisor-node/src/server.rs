//! Backend wiring and the keep-alive loop.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use labvisor_hypervisor::{
    BackendKind, Deployment, Dispatcher, Hypervisor, HypervisorServiceConfiguration,
    LocalDiskStore, MockBackend, Orchestrator, Vm,
};

use crate::commands::deploy_context;
use crate::config::Config;

/// Build the hypervisor the process talks to: the single configured
/// backend, or a dispatcher over all of them.
pub fn build_hypervisor(config: &HypervisorServiceConfiguration) -> Result<Arc<dyn Hypervisor>> {
    let mut uplinks = vec![config.uplink.clone()];
    uplinks.extend(
        config
            .vlan
            .reserved
            .iter()
            .filter(|r| r.on_uplink)
            .map(|r| r.name.clone()),
    );

    let mut backends: Vec<Arc<dyn Hypervisor>> = Vec::with_capacity(config.backends.len());
    for backend in &config.backends {
        let adapter: Arc<dyn Hypervisor> = match backend.kind {
            BackendKind::Mock => {
                info!(backend = %backend.name, "Using mock hypervisor backend");
                let mut mock = MockBackend::new(backend.name.as_str()).with_networks(uplinks.clone());
                if let Some(host) = &backend.host {
                    mock = mock.with_host(host.as_str());
                }
                Arc::new(mock)
            }
        };
        backends.push(adapter);
    }

    match backends.len() {
        0 => Err(anyhow::anyhow!("No hypervisor backends configured")),
        1 => Ok(backends.remove(0)),
        _ => Ok(Arc::new(
            Dispatcher::new(backends).context("Failed to create dispatcher")?,
        )),
    }
}

/// Build an orchestrator over `hypervisor` from the service configuration.
pub fn build_orchestrator(
    config: &HypervisorServiceConfiguration,
    hypervisor: Arc<dyn Hypervisor>,
) -> Result<Orchestrator> {
    let pool = config.vlan_pool().context("Failed to build VLAN pool")?;
    let classifier = config
        .classifier()
        .context("Failed to build network classifier")?;

    let mut disks = LocalDiskStore::new(&config.storage.disk_store);
    if let Some(qemu_img) = &config.storage.qemu_img {
        disks = disks.with_qemu_img(qemu_img.as_str());
    }

    Ok(
        Orchestrator::new(hypervisor, Arc::new(pool), Arc::new(disks), classifier)
            .with_wait_policy(config.deploy_wait.clone()),
    )
}

/// Cancel `token` on Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            token.cancel();
        }
    });
}

/// What the node currently hosts.
#[derive(Debug)]
pub struct Inventory {
    pub vms: Vec<Vm>,
    pub vlans_in_use: Vec<u16>,
}

/// Snapshot the VMs and VLANs held through `orchestrator`.
pub async fn inventory(orchestrator: &Orchestrator) -> Result<Inventory> {
    let vms = orchestrator
        .hypervisor()
        .find("")
        .await
        .context("Failed to list VMs")?;
    let vlans_in_use = orchestrator.vlan_pool().in_use()?;
    Ok(Inventory { vms, vlans_in_use })
}

/// Deploy every context in `files`, keep backends alive until Ctrl-C, then
/// tear the deployments down again.
pub async fn run(config: Config, files: Vec<PathBuf>) -> Result<()> {
    let hypervisor = build_hypervisor(&config.hypervisor)?;

    match hypervisor.health_check().await {
        Ok(true) => info!(backend = %hypervisor.name(), "Hypervisor healthy"),
        Ok(false) => warn!(backend = %hypervisor.name(), "Hypervisor reports unhealthy"),
        Err(e) => warn!(backend = %hypervisor.name(), error = %e, "Health check failed"),
    }

    let orchestrator = build_orchestrator(&config.hypervisor, hypervisor)?;
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let deployments = deploy_all(&orchestrator, &files, &shutdown).await;

    info!(
        node = %config.node.get_hostname(),
        interval_secs = config.hypervisor.keep_alive_secs,
        deployments = deployments.len(),
        "Keep-alive loop started"
    );
    let ticks = keep_alive(
        &orchestrator,
        config.hypervisor.keep_alive_interval(),
        config.managed_hosts(),
        shutdown,
    )
    .await;
    info!(ticks, "Keep-alive loop stopped");

    teardown_all(&orchestrator, deployments).await;
    Ok(())
}

/// Deploy each context file in turn. Files that fail to deploy are logged
/// and skipped.
pub async fn deploy_all(
    orchestrator: &Orchestrator,
    files: &[PathBuf],
    cancel: &CancellationToken,
) -> Vec<Deployment> {
    let mut deployments = Vec::with_capacity(files.len());
    for file in files {
        match deploy_context(orchestrator, file, true, cancel).await {
            Ok(deployment) => {
                info!(
                    deployment = %deployment.name,
                    members = deployment.members.len(),
                    failures = deployment.failures.len(),
                    "Deployment up"
                );
                deployments.push(deployment);
            }
            Err(e) => error!(file = %file.display(), error = %e, "Failed to deploy context"),
        }
    }
    deployments
}

/// Tear down every deployment, logging unclean reports.
pub async fn teardown_all(orchestrator: &Orchestrator, deployments: Vec<Deployment>) {
    for deployment in deployments {
        let name = deployment.name.clone();
        match orchestrator.delete_all(deployment).await {
            Ok(report) if report.is_clean() => {
                info!(deployment = %name, vms = report.deleted_vms.len(), "Deployment removed")
            }
            Ok(report) => warn!(
                deployment = %name,
                vm_errors = report.vm_errors.len(),
                disk_errors = report.disk_errors.len(),
                "Deployment removed with errors"
            ),
            Err(e) => error!(deployment = %name, error = %e, "Teardown failed"),
        }
    }
}

/// Periodically health-check the hypervisor, reload each host's inventory
/// and log what the node hosts. Returns the number of completed ticks.
pub async fn keep_alive(
    orchestrator: &Orchestrator,
    interval: Duration,
    hosts: Vec<String>,
    shutdown: CancellationToken,
) -> u64 {
    let hypervisor = orchestrator.hypervisor();
    let mut ticker = tokio::time::interval(interval);
    let mut ticks = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match hypervisor.health_check().await {
                    Ok(true) => debug!("Keep-alive: healthy"),
                    Ok(false) => warn!("Keep-alive: hypervisor unhealthy"),
                    Err(e) => warn!(error = %e, "Keep-alive: health check failed"),
                }
                for host in &hosts {
                    hypervisor.reload_host(host).await;
                }
                match inventory(orchestrator).await {
                    Ok(inv) => debug!(vms = inv.vms.len(), vlans = ?inv.vlans_in_use, "Keep-alive: inventory"),
                    Err(e) => warn!(error = %e, "Keep-alive: inventory failed"),
                }
                ticks += 1;
            }
        }
    }

    ticks
}
