//! End-to-end orchestration through the dispatcher.

use std::collections::BTreeSet;
use std::sync::Arc;

use labvisor_hypervisor::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Lab {
    rack_a: Arc<MockBackend>,
    rack_b: Arc<MockBackend>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<VlanPool>,
    orchestrator: Arc<Orchestrator>,
    _disks: TempDir,
}

fn lab(start: u16, end: u16) -> Lab {
    let disks = tempfile::tempdir().unwrap();
    let rack_a = Arc::new(MockBackend::new("rack-a").with_networks(["uplink"]));
    let rack_b = Arc::new(MockBackend::new("rack-b").with_networks(["uplink"]));
    let dispatcher = Arc::new(
        Dispatcher::new(vec![
            rack_a.clone() as Arc<dyn Hypervisor>,
            rack_b.clone() as Arc<dyn Hypervisor>,
        ])
        .unwrap(),
    );
    let pool = Arc::new(VlanPool::new(&VlanConfiguration::new(start, end)).unwrap());
    let orchestrator = Arc::new(
        Orchestrator::new(
            dispatcher.clone(),
            pool.clone(),
            Arc::new(LocalDiskStore::new(disks.path())),
            NetworkClassifier::new("uplink", "").unwrap(),
        )
        .with_wait_policy(WaitPolicy {
            poll_interval_ms: 10,
            timeout_secs: 5,
        }),
    );

    Lab {
        rack_a,
        rack_b,
        dispatcher,
        pool,
        orchestrator,
        _disks: disks,
    }
}

fn topology(tag: &str) -> DeploymentContext {
    DeploymentContext::new(format!("{}-topology", tag), tag)
        .with_template(
            VmTemplate::new("web")
                .with_network("lan")
                .with_placement("rack-a")
                .with_disk(DiskTemplate::new(format!("{}/web.qcow2", tag), 1).ephemeral()),
        )
        .with_template(VmTemplate::new("db").with_network("lan").with_placement("rack-b"))
        .with_template(
            VmTemplate::new("fw")
                .with_network("dmz")
                .with_network("uplink")
                .with_placement("rack-b"),
        )
}

#[tokio::test]
async fn topology_spans_backends_and_tears_down_cleanly() {
    let lab = lab(100, 104);

    let deployment = lab
        .orchestrator
        .deploy(topology("team-1"), true, &CancellationToken::new())
        .await
        .unwrap();

    assert!(deployment.is_complete(), "failures: {:?}", deployment.failures);
    assert_eq!(deployment.vlans.get("lan"), Some(&100));
    assert_eq!(deployment.vlans.get("dmz"), Some(&101));
    assert_eq!(lab.pool.available().unwrap(), 3);
    assert_eq!(lab.rack_a.vm_count(), 1);
    assert_eq!(lab.rack_b.vm_count(), 2);

    let fw = &deployment.members[2].vm;
    assert_eq!(fw.backend, "rack-b");
    assert_eq!(fw.networks[0].vlan, Some(101));
    assert_eq!(fw.networks[1].vlan, None);

    let tagged = lab.dispatcher.find("team-1").await.unwrap();
    assert_eq!(tagged.len(), 3);

    let web_id = deployment.members[0].vm.id.clone();
    let owner = lab.dispatcher.resolve(&web_id).await.unwrap();
    assert_eq!(owner.name(), "rack-a");
    let stopped = lab.dispatcher.stop(&web_id).await.unwrap();
    assert_eq!(stopped.state, VmState::Stopped);

    let report = lab.orchestrator.delete_all(deployment).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.deleted_vms.len(), 3);
    assert_eq!(report.deleted_disks, vec!["team-1/web.qcow2".to_string()]);
    assert_eq!(lab.pool.available().unwrap(), 5);
    assert_eq!(lab.rack_a.vm_count() + lab.rack_b.vm_count(), 0);
}

#[tokio::test]
async fn failure_on_one_backend_keeps_the_rest() {
    let lab = lab(100, 104);
    lab.rack_b.fail_deploy("db").unwrap();

    let deployment = lab
        .orchestrator
        .deploy(topology("team-2"), true, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(deployment.failures.len(), 1);
    assert_eq!(deployment.failures[0].template, "db");
    assert!(deployment.failures[0].reason.contains("simulated platform failure"));
    assert_eq!(deployment.members.len(), 2);
    assert!(deployment.ensure_complete().is_err());

    let web = lab
        .dispatcher
        .load(&deployment.members[0].vm.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(web.state, VmState::Running);

    // The VLAN stays held while the partial deployment is up
    assert_eq!(lab.pool.available().unwrap(), 3);
    lab.orchestrator.delete_all(deployment).await.unwrap();
    assert_eq!(lab.pool.available().unwrap(), 5);
}

#[tokio::test]
async fn vm_removed_out_of_band_still_tears_down() {
    let lab = lab(100, 104);
    let deployment = lab
        .orchestrator
        .deploy(topology("team-3"), false, &CancellationToken::new())
        .await
        .unwrap();

    lab.dispatcher
        .delete(&deployment.members[1].vm.id)
        .await
        .unwrap();

    let report = lab.orchestrator.delete_all(deployment).await.unwrap();
    assert!(report.vm_errors.is_empty());
    assert_eq!(report.deleted_vms.len(), 3);
    assert_eq!(lab.pool.available().unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deployments_never_share_vlans() {
    let lab = lab(100, 107);

    let mut handles = Vec::new();
    for i in 0..4 {
        let orchestrator = lab.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let context = DeploymentContext::new(format!("lab-{}", i), format!("team-{}", i))
                .with_template(VmTemplate::new("a").with_network("red").with_placement("rack-a"))
                .with_template(VmTemplate::new("b").with_network("blue").with_placement("rack-b"));
            orchestrator
                .deploy(context, false, &CancellationToken::new())
                .await
        }));
    }

    let mut seen = BTreeSet::new();
    for handle in handles {
        let deployment = handle.await.unwrap().unwrap();
        assert!(deployment.is_complete());
        for id in deployment.allocated_vlans() {
            assert!(seen.insert(id), "VLAN {} handed out twice", id);
        }
    }
    assert_eq!(seen.len(), 8);
    assert_eq!(lab.pool.available().unwrap(), 0);

    let extra = DeploymentContext::new("late", "late")
        .with_template(VmTemplate::new("c").with_network("green"));
    let err = lab
        .orchestrator
        .deploy(extra, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HypervisorError::PoolExhausted { .. }));
    assert_eq!(lab.rack_a.vm_count() + lab.rack_b.vm_count(), 8);
}
