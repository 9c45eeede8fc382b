// Kubernetes lab end-to-end against the simulated cloud.

mod common;

use anyhow::Result;
use gce_lab_manager::core::resources::Resource;
use gce_lab_manager::core::simulated::{ProviderCall, SimulatedCloud};
use gce_lab_manager::core::{Deployer, GuestScript};
use gce_lab_manager::errors::{LabError, ReadinessError};
use gce_lab_manager::monitoring::InstanceState;
use gce_lab_manager::topology::{ClusterLabOutput, ClusterPlan};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use common::{cluster_options, config_dir, context, key_pair, PROJECT};

fn instance_created(name: &str) -> impl Fn(&ProviderCall) -> bool + '_ {
    move |call| matches!(call, ProviderCall::Instance { spec, .. } if spec.name == name)
}

fn polled(name: &str) -> impl Fn(&ProviderCall) -> bool + '_ {
    move |call| matches!(call, ProviderCall::GuestQuery { instance, .. } if instance == name)
}

// Bastion first, three control planes with one worker each, seven gates
#[tokio::test(start_paused = true)]
async fn test_bastion_lab_with_three_clusters() -> Result<()> {
    let dir = config_dir();
    let keys = key_pair(dir.path());
    let plan = ClusterPlan::assemble(&context("lab"), &cluster_options(dir.path(), true), &keys).await?;
    assert_eq!(plan.graph.count_kind("readiness"), 7);

    let cloud = Arc::new(SimulatedCloud::new(PROJECT).with_default_script(GuestScript::completes_after(2)));
    let deployer = Deployer::new(cloud.clone(), cloud.clone());
    let outputs = deployer.deploy(&plan.graph, &CancellationToken::new()).await?;

    assert_eq!(outputs.ready_markers().count(), 7);
    assert_eq!(deployer.progress().count(InstanceState::Ready).await, 7);

    let instances = cloud.instances();
    assert_eq!(instances.len(), 7);
    assert_eq!(instances[0].0.name, "lab-bastion-0");

    let bastion_ready = cloud.last_position(polled("lab-bastion-0")).expect("bastion polled");
    for i in 0..3 {
        let cp = format!("lab-k8s-cp-{}", i);
        let worker = format!("lab-k8s-{}-wk-0", i);
        let cp_created = cloud.position(instance_created(&cp)).expect("control plane created");
        let cp_ready = cloud.last_position(polled(&cp)).expect("control plane polled");
        let worker_created = cloud.position(instance_created(&worker)).expect("worker created");

        assert!(bastion_ready < cp_created, "{} created before the bastion was ready", cp);
        assert!(cp_ready < worker_created, "{} created before {} was ready", worker, cp);
        assert_eq!(cloud.polls_of(&cp), 3);
    }

    let output = ClusterLabOutput::collect(&plan, &outputs, &keys.private_key)?;
    assert_eq!(output.access.len(), 1);
    assert!(output.access[0].starts_with("34."));
    assert_eq!(output.config_bucket, "lab-k8s-config-bucket-4242");
    assert_eq!(output.clusters.len(), 3);
    for cluster in &output.clusters {
        assert_eq!(cluster.control_planes.len(), 1);
        assert_eq!(cluster.workers.len(), 1);
        assert!(cluster.control_planes[0].starts_with("192.168."));
    }
    Ok(())
}

// Everything after the bastion waits for its readiness gate
#[tokio::test]
async fn test_all_cluster_resources_wait_for_the_bastion() -> Result<()> {
    let dir = config_dir();
    let keys = key_pair(dir.path());
    let plan = ClusterPlan::assemble(&context("lab"), &cluster_options(dir.path(), true), &keys).await?;
    let gate = plan.bastion_gate.clone().expect("bastion gate");

    for (id, spec) in plan.graph.instances() {
        if spec.name != "lab-bastion-0" {
            assert!(plan.graph.depends_transitively(id, &gate), "{} does not wait for the bastion", id);
        }
    }
    assert!(plan.graph.depends_transitively(&plan.mesh_firewall, &gate));

    let bastion = plan.bastion.as_ref().expect("bastion");
    let bastion_node = plan.graph.node(&bastion.id)?;
    match &bastion_node.resource {
        Resource::Instance(spec) => {
            assert_eq!(spec.machine_type, "e2-standard-8");
            assert_eq!(spec.subnet, "lab-access-subnet");
            assert_eq!(spec.metadata["enable-guest-attributes"], "TRUE");
            assert!(spec.startup_script.contains("LAB=lab ACCESS=2 CLUSTERS=3"));
        }
        other => panic!("unexpected resource {:?}", other),
    }
    Ok(())
}

// Workers learn their control plane through metadata and the startup script
#[tokio::test]
async fn test_workers_carry_their_control_plane_name() -> Result<()> {
    let dir = config_dir();
    let keys = key_pair(dir.path());
    let plan = ClusterPlan::assemble(&context("lab"), &cluster_options(dir.path(), true), &keys).await?;

    for cluster in &plan.clusters {
        for worker in &cluster.workers {
            match &plan.graph.node(&worker.id)?.resource {
                Resource::Instance(spec) => {
                    assert_eq!(spec.metadata["cp"], cluster.control_plane.name);
                    assert!(spec.startup_script.contains(&format!("CP={}", cluster.control_plane.name)));
                    assert!(spec.public_address.is_none());
                }
                other => panic!("unexpected resource {:?}", other),
            }
            assert!(plan.graph.depends_transitively(&worker.id, &cluster.control_plane_gate));
        }
    }
    Ok(())
}

// Without a bastion: no access tier, public control planes
#[tokio::test(start_paused = true)]
async fn test_lab_without_bastion_exposes_nodes_directly() -> Result<()> {
    let dir = config_dir();
    let keys = key_pair(dir.path());
    let plan = ClusterPlan::assemble(&context("lab"), &cluster_options(dir.path(), false), &keys).await?;
    assert!(plan.bastion.is_none());
    assert_eq!(plan.graph.count_kind("readiness"), 6);
    assert_eq!(plan.graph.count_kind("router"), 0);

    let cloud = Arc::new(SimulatedCloud::new(PROJECT));
    let outputs = Deployer::new(cloud.clone(), cloud.clone())
        .deploy(&plan.graph, &CancellationToken::new())
        .await?;

    let subnet_created = |name: &str| cloud.position(|c| matches!(c, ProviderCall::Subnet(s) if s.name == name));
    assert!(subnet_created("lab-access-subnet").is_none());
    assert!(subnet_created("lab-k8s-subnet-1").is_some());

    let instances = cloud.instances();
    assert!(instances.iter().all(|(spec, _)| !spec.name.contains("bastion")));
    assert!(instances
        .iter()
        .filter(|(spec, _)| spec.name.starts_with("lab-k8s-cp-"))
        .all(|(_, nat_ip)| nat_ip.is_some()));

    let mesh = cloud
        .firewalls()
        .into_iter()
        .find(|r| r.name == "lab-k8s-fw-rule")
        .expect("mesh rule");
    assert_eq!(mesh.source_identities, vec!["lab-k8s-sa@lab-project.iam.gserviceaccount.com"]);

    let output = ClusterLabOutput::collect(&plan, &outputs, &keys.private_key)?;
    assert!(output.access.is_empty());
    assert!(output.clusters.iter().all(|c| c.control_planes[0].starts_with("34.")));
    Ok(())
}

// A failed control plane stops its workers from ever being created
#[tokio::test(start_paused = true)]
async fn test_failed_gate_blocks_its_dependents() -> Result<()> {
    let dir = config_dir();
    let keys = key_pair(dir.path());
    let plan = ClusterPlan::assemble(&context("lab"), &cluster_options(dir.path(), true), &keys).await?;

    let cloud = Arc::new(
        SimulatedCloud::new(PROJECT)
            .with_default_script(GuestScript::completes_after(3))
            .with_script("lab-k8s-cp-1", GuestScript::reports(1, "failed")),
    );
    let deployer = Deployer::new(cloud.clone(), cloud.clone());
    let err = deployer
        .deploy(&plan.graph, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        LabError::ReadinessError(ReadinessError::GuestReportedFailure {
            instance,
            value,
            query_path,
            ..
        }) => {
            assert_eq!(instance, "lab-k8s-cp-1");
            assert_eq!(value, "failed");
            assert_eq!(query_path, "status/startup");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(cloud.position(instance_created("lab-k8s-1-wk-0")).is_none());
    assert_eq!(cloud.polls_of("lab-k8s-cp-1"), 2);
    assert_eq!(deployer.progress().state("lab-k8s-cp-1").await, Some(InstanceState::Failed));
    Ok(())
}

// Same options, same graph
#[tokio::test]
async fn test_cluster_plan_is_repeatable() -> Result<()> {
    let dir = config_dir();
    let keys = key_pair(dir.path());
    let options = cluster_options(dir.path(), true);

    let first = ClusterPlan::assemble(&context("lab"), &options, &keys).await?;
    let second = ClusterPlan::assemble(&context("lab"), &options, &keys).await?;

    assert_eq!(serde_json::to_value(&first.graph)?, serde_json::to_value(&second.graph)?);
    Ok(())
}

// Missing templates are reported with their path before anything is created
#[tokio::test]
async fn test_missing_template_is_a_planning_error() -> Result<()> {
    let dir = config_dir();
    let keys = key_pair(dir.path());
    std::fs::remove_file(dir.path().join("K8S/userData/k8s.sh"))?;

    let err = ClusterPlan::assemble(&context("lab"), &cluster_options(dir.path(), true), &keys)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("k8s.sh"));
    Ok(())
}

// Control-plane-only clusters open no worker ports
#[tokio::test]
async fn test_clusters_without_workers_declare_no_worker_firewall() -> Result<()> {
    let dir = config_dir();
    let keys = key_pair(dir.path());
    let mut options = cluster_options(dir.path(), true);
    options.workers_num = 0;

    let plan = ClusterPlan::assemble(&context("lab"), &options, &keys).await?;

    assert_eq!(plan.graph.count_kind("readiness"), 4);
    assert!(plan.clusters.iter().all(|c| c.workers.is_empty()));
    assert!(plan
        .graph
        .iter()
        .all(|node| !node.id.as_str().contains("-wk-publiclyopened-fw-rule")));
    assert_eq!(plan.graph.count_kind("firewall"), 3);
    Ok(())
}
