//! # Labvisor Hypervisor
//!
//! Orchestration core for deploying isolated lab topologies across one or
//! more hypervisor platforms.
//!
//! - **[`Hypervisor`]** - the lifecycle contract every backend implements
//! - **[`Dispatcher`]** - presents several backends as one, resolving VM
//!   ownership per call
//! - **[`VlanPool`]** - thread-safe allocator of isolation VLAN ids
//! - **[`Orchestrator`]** - deploys and tears down multi-VM topologies
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             Orchestrator                │
//! │  (bind VLANs, verify disks, deploy)     │
//! └──────┬───────────────┬──────────────────┘
//!        │               │
//!        ▼               ▼
//! ┌─────────────┐  ┌──────────────────────────┐
//! │  VlanPool   │  │   Hypervisor (trait)     │
//! │ DiskStore   │  │ (deploy, start, stop...) │
//! └─────────────┘  └────────────┬─────────────┘
//!                               │
//!                ┌──────────────┴──────────────┐
//!                ▼                             ▼
//!        ┌───────────────┐            ┌────────────────┐
//!        │  Dispatcher   │───────────▶│  MockBackend   │
//!        │ (N backends)  │            │ (per platform) │
//!        └───────────────┘            └────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use labvisor_hypervisor::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let backend = Arc::new(MockBackend::new("rack-a"));
//!     let pool = Arc::new(VlanPool::new(&VlanConfiguration::default())?);
//!     let orchestrator = Orchestrator::new(
//!         backend,
//!         pool,
//!         Arc::new(LocalDiskStore::new("/var/lib/labvisor/disks")),
//!         NetworkClassifier::new("uplink", "")?,
//!     );
//!
//!     let context = DeploymentContext::new("lab", "team-1")
//!         .with_template(VmTemplate::new("router").with_network("lan"));
//!     let deployment = orchestrator.deploy(context, true, &CancellationToken::new()).await?;
//!     orchestrator.delete_all(deployment).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod deployment;
pub mod dispatcher;
pub mod error;
pub mod mock;
pub mod network;
pub mod storage;
pub mod traits;
pub mod types;
pub mod vlan;

pub use config::{BackendConfig, BackendKind, HypervisorServiceConfiguration, StorageConfig};
pub use deployment::{
    DeployedMember,
    Deployment,
    DeploymentContext,
    MemberFailure,
    Orchestrator,
    TeardownReport,
    WaitPolicy,
};
pub use dispatcher::Dispatcher;
pub use error::{HypervisorError, Result};
pub use mock::MockBackend;
pub use network::{NetworkClassifier, NetworkKind};
pub use storage::{DiskOutcome, DiskStore, LocalDiskStore};
pub use traits::Hypervisor;
pub use types::*;
pub use vlan::{ReservedVlan, VlanConfiguration, VlanPool, MAX_VLAN_ID, MIN_VLAN_ID};
