//! Multi-backend dispatcher.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Dispatcher                               │
//! │  - resolve(id): probe every backend concurrently, then route     │
//! │  - no ownership cache: every call resolves again                 │
//! └─────────────────────────┬───────────────────────────────────────┘
//!                           │
//!       ┌───────────────────┼───────────────────┐
//!       ▼                   ▼                   ▼
//! ┌───────────┐      ┌───────────┐       ┌───────────┐
//! │ Backend A │      │ Backend B │       │ Backend C │
//! └───────────┘      └───────────┘       └───────────┘
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::Hypervisor;
use crate::types::*;

/// Presents N registered backends as one [`Hypervisor`].
pub struct Dispatcher {
    name: String,
    backends: Vec<Arc<dyn Hypervisor>>,
}

impl Dispatcher {
    /// Create a dispatcher over `backends`. Backend names must be unique.
    pub fn new(backends: Vec<Arc<dyn Hypervisor>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(HypervisorError::InvalidConfig(
                "dispatcher needs at least one backend".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for backend in &backends {
            if !names.insert(backend.name().to_string()) {
                return Err(HypervisorError::InvalidConfig(format!(
                    "backend name {} registered twice",
                    backend.name()
                )));
            }
        }

        info!(backends = backends.len(), "Dispatcher created");
        Ok(Self {
            name: "dispatcher".to_string(),
            backends,
        })
    }

    /// Registered backends in registration order.
    pub fn backends(&self) -> &[Arc<dyn Hypervisor>] {
        &self.backends
    }

    /// Find the single backend that owns `vm_id`.
    ///
    /// Probes every backend concurrently and waits for all of them. Zero
    /// owners is `VmNotFound`; more than one is `AmbiguousOwnership`.
    pub async fn resolve(&self, vm_id: &str) -> Result<Arc<dyn Hypervisor>> {
        let index = self.resolve_index(vm_id).await?;
        Ok(self.backends[index].clone())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn resolve_index(&self, vm_id: &str) -> Result<usize> {
        let probes = self.backends.iter().map(|backend| backend.load(vm_id));
        let results = join_all(probes).await;

        let mut owners = Vec::new();
        let mut first_error = None;
        let mut failed = 0;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(Some(_)) => owners.push(index),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        backend = %self.backends[index].name(),
                        error = %e,
                        "Ownership probe failed"
                    );
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        match owners.as_slice() {
            [index] => {
                debug!(backend = %self.backends[*index].name(), "Resolved VM owner");
                Ok(*index)
            }
            [] => match first_error {
                Some(e) if failed == self.backends.len() => Err(e),
                _ => Err(HypervisorError::VmNotFound(vm_id.to_string())),
            },
            _ => {
                let backends: Vec<String> = owners
                    .iter()
                    .map(|i| self.backends[*i].name().to_string())
                    .collect();
                warn!(backends = ?backends, "VM claimed by multiple backends");
                Err(HypervisorError::AmbiguousOwnership {
                    vm_id: vm_id.to_string(),
                    backends,
                })
            }
        }
    }

    /// Pick the backend for a new VM: the placement hint if given, otherwise
    /// the backend currently holding the fewest VMs.
    async fn place(&self, template: &VmTemplate) -> Result<Arc<dyn Hypervisor>> {
        if let Some(hint) = &template.placement {
            return self
                .backends
                .iter()
                .find(|b| b.name() == hint.as_str())
                .cloned()
                .ok_or_else(|| {
                    HypervisorError::provisioning(
                        &template.name,
                        format!("no backend named {}", hint),
                    )
                });
        }

        let loads = join_all(self.backends.iter().map(|b| b.find(""))).await;
        let mut best: Option<(usize, usize)> = None;
        for (index, load) in loads.into_iter().enumerate() {
            match load {
                Ok(vms) => {
                    if best.map_or(true, |(_, count)| vms.len() < count) {
                        best = Some((index, vms.len()));
                    }
                }
                Err(e) => warn!(
                    backend = %self.backends[index].name(),
                    error = %e,
                    "Skipping backend for placement"
                ),
            }
        }

        best.map(|(index, _)| self.backends[index].clone())
            .ok_or_else(|| HypervisorError::provisioning(&template.name, "no backend available"))
    }

    /// Sorted, de-duplicated union of a listing across all backends.
    ///
    /// Backends whose listing fails are skipped; the call fails only when
    /// every backend does.
    async fn union<F, Fut>(&self, list: F) -> Result<Vec<String>>
    where
        F: Fn(Arc<dyn Hypervisor>) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<String>>>,
    {
        let results = join_all(self.backends.iter().cloned().map(list)).await;
        let mut names = BTreeSet::new();
        let mut first_error = None;
        let mut answered = 0;
        for (backend, result) in self.backends.iter().zip(results) {
            match result {
                Ok(listing) => {
                    answered += 1;
                    names.extend(listing);
                }
                Err(e) => {
                    warn!(backend = %backend.name(), error = %e, "Skipping backend listing");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if answered == 0 => Err(e),
            _ => Ok(names.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Hypervisor for Dispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<bool> {
        let results = join_all(self.backends.iter().map(|b| b.health_check())).await;
        let mut healthy = true;
        for (backend, result) in self.backends.iter().zip(results) {
            match result {
                Ok(true) => {}
                Ok(false) => {
                    warn!(backend = %backend.name(), "Backend unhealthy");
                    healthy = false;
                }
                Err(e) => {
                    warn!(backend = %backend.name(), error = %e, "Health check failed");
                    healthy = false;
                }
            }
        }
        Ok(healthy)
    }

    async fn load(&self, vm_id: &str) -> Result<Option<Vm>> {
        match self.resolve(vm_id).await {
            Ok(backend) => backend.load(vm_id).await,
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, template), fields(template = %template.name))]
    async fn deploy(&self, template: &VmTemplate, privileged: bool) -> Result<Vm> {
        let backend = self.place(template).await?;
        info!(backend = %backend.name(), "Placing VM");
        backend.deploy(template, privileged).await
    }

    async fn change_state(&self, vm_id: &str, operation: VmOperation) -> Result<Vm> {
        self.resolve(vm_id)
            .await?
            .change_state(vm_id, operation)
            .await
    }

    async fn change_configuration(&self, vm_id: &str, change: VmChange) -> Result<Vm> {
        self.resolve(vm_id)
            .await?
            .change_configuration(vm_id, change)
            .await
    }

    async fn display(&self, vm_id: &str) -> Result<ConsoleInfo> {
        self.resolve(vm_id).await?.display(vm_id).await
    }

    async fn find(&self, search: &str) -> Result<Vec<Vm>> {
        let results = join_all(self.backends.iter().map(|b| b.find(search))).await;
        let mut vms = Vec::new();
        for result in results {
            vms.extend(result?);
        }
        Ok(vms)
    }

    async fn iso_options(&self, key: &str) -> Result<Vec<String>> {
        match self.resolve(key).await {
            Ok(backend) => backend.iso_options(key).await,
            Err(e) if e.is_not_found() => {
                let key = key.to_string();
                self.union(|b| {
                    let key = key.clone();
                    async move { b.iso_options(&key).await }
                })
                .await
            }
            Err(e) => Err(e),
        }
    }

    async fn net_options(&self, key: &str) -> Result<Vec<String>> {
        match self.resolve(key).await {
            Ok(backend) => backend.net_options(key).await,
            Err(e) if e.is_not_found() => {
                let key = key.to_string();
                self.union(|b| {
                    let key = key.clone();
                    async move { b.net_options(&key).await }
                })
                .await
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, vm_ids), fields(tag = %tag, count = vm_ids.len()))]
    async fn set_affinity(&self, tag: &str, vm_ids: &[String], start: bool) -> Result<Vec<Vm>> {
        let owners = join_all(vm_ids.iter().map(|id| self.resolve_index(id))).await;

        let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (id, owner) in vm_ids.iter().zip(owners) {
            groups.entry(owner?).or_default().push(id.clone());
        }

        if groups.len() > 1 {
            warn!(backends = groups.len(), "Affinity group spans several backends");
        }

        let mut vms = Vec::with_capacity(vm_ids.len());
        for (index, ids) in groups {
            vms.extend(self.backends[index].set_affinity(tag, &ids, start).await?);
        }
        Ok(vms)
    }

    async fn reload_host(&self, host: &str) {
        join_all(self.backends.iter().map(|b| b.reload_host(host))).await;
    }

    async fn deploy_all(&self, _target: &str) -> Result<Vec<Vm>> {
        Err(HypervisorError::unsupported(&self.name, "deploy_all"))
    }

    async fn stop_all(&self, _target: &str) -> Result<Vec<Vm>> {
        Err(HypervisorError::unsupported(&self.name, "stop_all"))
    }

    async fn verify_disks(&self, _template: &VmTemplate) -> Result<Vec<DiskStatus>> {
        Err(HypervisorError::unsupported(&self.name, "verify_disks"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    fn template(name: &str) -> VmTemplate {
        let mut t = VmTemplate::new(name).with_network("lan");
        t.networks[0].vlan = Some(200);
        t
    }

    fn imported(id: &str) -> Vm {
        Vm {
            id: id.to_string(),
            name: "imported".to_string(),
            state: VmState::Stopped,
            backend: String::new(),
            host: String::new(),
            isolation_tag: None,
            has_snapshot: false,
            networks: Vec::new(),
        }
    }

    fn pair() -> (Arc<MockBackend>, Arc<MockBackend>, Dispatcher) {
        let a = Arc::new(MockBackend::new("alpha").with_isos(["a.iso", "shared.iso"]));
        let b = Arc::new(MockBackend::new("beta").with_isos(["b.iso", "shared.iso"]));
        let dispatcher = Dispatcher::new(vec![a.clone() as Arc<dyn Hypervisor>, b.clone()]).unwrap();
        (a, b, dispatcher)
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let (_, _, dispatcher) = pair();
        let err = dispatcher.resolve("missing").await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_resolve_single_owner() {
        let (_, b, dispatcher) = pair();
        let vm = b.deploy(&template("web"), false).await.unwrap();

        let owner = dispatcher.resolve(&vm.id).await.unwrap();
        assert_eq!(owner.name(), "beta");
    }

    #[tokio::test]
    async fn test_resolve_ambiguous() {
        let (a, b, dispatcher) = pair();
        a.import_vm(imported("dup")).unwrap();
        b.import_vm(imported("dup")).unwrap();

        let err = dispatcher.resolve("dup").await.err().unwrap();
        match err {
            HypervisorError::AmbiguousOwnership { vm_id, backends } => {
                assert_eq!(vm_id, "dup");
                assert_eq!(backends, vec!["alpha".to_string(), "beta".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Routed operations refuse to guess as well
        assert!(dispatcher.stop("dup").await.is_err());
    }

    #[tokio::test]
    async fn test_routes_lifecycle_to_owner() {
        let (a, _, dispatcher) = pair();
        let vm = a.deploy(&template("db"), false).await.unwrap();

        let running = dispatcher.start(&vm.id).await.unwrap();
        assert_eq!(running.state, VmState::Running);
        assert_eq!(running.backend, "alpha");

        let stopped = dispatcher.stop(&vm.id).await.unwrap();
        assert_eq!(stopped.state, VmState::Stopped);

        dispatcher.delete(&vm.id).await.unwrap();
        assert!(dispatcher.start(&vm.id).await.unwrap_err().is_not_found());
        assert!(dispatcher.load(&vm.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_places_on_least_loaded() {
        let (a, _, dispatcher) = pair();
        a.deploy(&template("existing"), false).await.unwrap();

        let vm = dispatcher.deploy(&template("new"), false).await.unwrap();
        assert_eq!(vm.backend, "beta");

        let pinned = dispatcher
            .deploy(&template("pinned").with_placement("alpha"), false)
            .await
            .unwrap();
        assert_eq!(pinned.backend, "alpha");

        assert!(dispatcher
            .deploy(&template("lost").with_placement("gamma"), false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_find_spans_backends() {
        let (a, b, dispatcher) = pair();
        a.deploy(&template("lab-1"), false).await.unwrap();
        b.deploy(&template("lab-2"), false).await.unwrap();
        b.deploy(&template("other"), false).await.unwrap();

        assert_eq!(dispatcher.find("lab").await.unwrap().len(), 2);
        assert_eq!(dispatcher.find("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_affinity_groups_by_owner() {
        let (a, b, dispatcher) = pair();
        let x = a.deploy(&template("x"), false).await.unwrap();
        let y = b.deploy(&template("y"), false).await.unwrap();

        let vms = dispatcher
            .set_affinity("team", &[x.id.clone(), y.id.clone()], false)
            .await
            .unwrap();
        assert_eq!(vms.len(), 2);
        assert!(vms.iter().all(|vm| vm.isolation_tag.as_deref() == Some("team")));

        assert!(dispatcher
            .set_affinity("team", &["ghost".to_string()], false)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_options_owner_or_union() {
        let (a, _, dispatcher) = pair();
        let vm = a.deploy(&template("iso"), false).await.unwrap();

        assert_eq!(
            dispatcher.iso_options(&vm.id).await.unwrap(),
            vec!["a.iso".to_string(), "shared.iso".to_string()]
        );
        assert_eq!(
            dispatcher.iso_options("new-topology").await.unwrap(),
            vec!["a.iso".to_string(), "b.iso".to_string(), "shared.iso".to_string()]
        );
        assert!(dispatcher
            .net_options(&vm.id)
            .await
            .unwrap()
            .contains(&"lan#200".to_string()));
    }

    #[tokio::test]
    async fn test_union_skips_unavailable_backend() {
        let (a, b, dispatcher) = pair();
        b.set_healthy(false);

        assert_eq!(
            dispatcher.iso_options("new-topology").await.unwrap(),
            vec!["a.iso".to_string(), "shared.iso".to_string()]
        );

        a.set_healthy(false);
        assert!(dispatcher.iso_options("new-topology").await.is_err());
    }

    #[tokio::test]
    async fn test_bulk_operations_unsupported() {
        let (_, _, dispatcher) = pair();
        assert!(matches!(
            dispatcher.deploy_all("team").await,
            Err(HypervisorError::Unsupported { .. })
        ));
        assert!(matches!(
            dispatcher.stop_all("team").await,
            Err(HypervisorError::Unsupported { .. })
        ));
        assert!(matches!(
            dispatcher.verify_disks(&template("t")).await,
            Err(HypervisorError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_health_requires_all_backends() {
        let (_, b, dispatcher) = pair();
        assert!(dispatcher.health_check().await.unwrap());
        b.set_healthy(false);
        assert!(!dispatcher.health_check().await.unwrap());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let a: Arc<dyn Hypervisor> = Arc::new(MockBackend::new("same"));
        let b: Arc<dyn Hypervisor> = Arc::new(MockBackend::new("same"));
        assert!(Dispatcher::new(vec![a, b]).is_err());
        assert!(Dispatcher::new(Vec::new()).is_err());
    }
}
