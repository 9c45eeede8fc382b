use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::core::graph::{ResourceGraph, ResourceId};
use crate::core::resources::Resource;
use crate::errors::LabResult;
use crate::topology::instances::{InstanceGroup, ProvisionedInstance};
use crate::topology::network::{public_ports_rule, NetworkAssembler, NetworkRef, SubnetRef};
use crate::topology::{IdentityRef, LabContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmFleetOptions {
    pub vm_num: u32,
    pub role_id: String,
    pub vm_type: String,
    pub image: String,
    pub os_username: String,
    pub public: bool,
    pub user_data: String,
    /// No firewall rule is declared when empty.
    pub publicly_opened_fw_ports: Vec<String>,
    pub extra_metadata: BTreeMap<String, String>,
}

/// Handles of everything a fleet declared or reused.
#[derive(Debug, Clone)]
pub struct FleetHandles {
    pub identity: IdentityRef,
    pub network: NetworkRef,
    pub subnets: Vec<SubnetRef>,
    pub firewall: Option<ResourceId>,
    pub instances: Vec<ProvisionedInstance>,
}

/// Homogeneous group of instances with a shared identity, network and public port rule.
///
/// Standalone fleets create their own service account and VPC; composed fleets
/// (the cluster lab's tiers) are handed pre-declared ones.
pub struct VmFleet<'a> {
    ctx: &'a LabContext,
    options: &'a VmFleetOptions,
    identity: Option<IdentityRef>,
    network: Option<(NetworkRef, Vec<SubnetRef>)>,
    after: Vec<ResourceId>,
}

impl<'a> VmFleet<'a> {
    pub fn new(ctx: &'a LabContext, options: &'a VmFleetOptions) -> Self {
        Self {
            ctx,
            options,
            identity: None,
            network: None,
            after: Vec::new(),
        }
    }

    pub fn with_identity(mut self, identity: IdentityRef) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_network(mut self, network: NetworkRef, subnets: Vec<SubnetRef>) -> Self {
        self.network = Some((network, subnets));
        self
    }

    /// Every resource of the fleet waits for these nodes.
    pub fn after(mut self, nodes: impl IntoIterator<Item = ResourceId>) -> Self {
        self.after.extend(nodes);
        self
    }

    pub fn assemble(self, graph: &mut ResourceGraph) -> LabResult<FleetHandles> {
        let ctx = self.ctx;
        let opts = self.options;

        let identity = match self.identity {
            Some(identity) => identity,
            None => IdentityRef::declare(
                graph,
                &ctx.project,
                format!("{}-{}-sa", ctx.lab_name, opts.role_id),
                format!("SA for {}-{} VMs", ctx.lab_name, opts.role_id),
                self.after.iter().cloned(),
            )?,
        };

        let (network, subnets) = match self.network {
            Some(shared) => shared,
            None => {
                let assembler = NetworkAssembler::new(&ctx.lab_name, &ctx.region, ctx.existing_network.as_deref());
                let network = assembler.network(graph, "vms-vpc")?;
                let subnets = vec![
                    assembler.subnet(graph, &network, "vms-subnet-1", "192.168.1.0/24", false)?,
                    assembler.subnet(graph, &network, "vms-subnet-2", "192.168.2.0/24", false)?,
                ];
                (network, subnets)
            }
        };

        let mut common = self.after.clone();
        common.push(identity.id.clone());
        common.push(network.id.clone());

        let firewall = if opts.vm_num == 0 || opts.publicly_opened_fw_ports.is_empty() {
            None
        } else {
            let rule = public_ports_rule(
                &ctx.lab_name,
                &opts.role_id,
                &network.name,
                &opts.publicly_opened_fw_ports,
                identity.email(),
            );
            Some(graph.add(rule.name.clone(), Resource::Firewall(rule), common.iter().cloned())?)
        };

        let instances = InstanceGroup {
            lab_name: &ctx.lab_name,
            role_id: &opts.role_id,
            region: &ctx.region,
            count: opts.vm_num,
            machine_type: &opts.vm_type,
            image: &opts.image,
            os_username: &opts.os_username,
            public_key: &ctx.public_key,
            startup_script: &opts.user_data,
            extra_metadata: &opts.extra_metadata,
            network: &network.name,
            subnets: &subnets,
            public: opts.public,
            service_identity: identity.email(),
            depends_on: &common,
        }
        .provision(graph)?;

        info!(
            "Planned {} {} instance(s) for lab {}",
            instances.len(),
            opts.role_id,
            ctx.lab_name
        );

        Ok(FleetHandles {
            identity,
            network,
            subnets,
            firewall,
            instances,
        })
    }
}

/// A standalone fleet: no readiness gates.
#[derive(Debug, Clone)]
pub struct VmFleetPlan {
    pub graph: ResourceGraph,
    pub fleet: FleetHandles,
}

impl VmFleetPlan {
    pub fn assemble(ctx: &LabContext, options: &VmFleetOptions) -> LabResult<Self> {
        let mut graph = ResourceGraph::new();
        let fleet = VmFleet::new(ctx, options).assemble(&mut graph)?;
        Ok(Self { graph, fleet })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::readiness::PollSettings;

    fn ctx() -> LabContext {
        LabContext {
            project: "proj".into(),
            region: "us-central1".into(),
            lab_name: "demo".into(),
            public_key: "ssh-ed25519 AAAA ubuntu@gcp".into(),
            existing_network: None,
            poll: PollSettings::default(),
        }
    }

    fn options(ports: &[&str]) -> VmFleetOptions {
        VmFleetOptions {
            vm_num: 2,
            role_id: "vm".into(),
            vm_type: "e2-medium".into(),
            image: "ubuntu-2204-lts".into(),
            os_username: "ubuntu".into(),
            public: true,
            user_data: String::new(),
            publicly_opened_fw_ports: ports.iter().map(|p| p.to_string()).collect(),
            extra_metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_standalone_fleet_declares_its_own_identity_and_network() {
        let plan = VmFleetPlan::assemble(&ctx(), &options(&["22"])).unwrap();

        assert_eq!(plan.fleet.identity.identity.account_id, "demo-vm-sa");
        assert_eq!(plan.fleet.identity.email(), "demo-vm-sa@proj.iam.gserviceaccount.com");
        assert_eq!(plan.fleet.network.name, "demo-vms-vpc");
        assert_eq!(plan.fleet.subnets.len(), 2);
        assert_eq!(plan.graph.count_kind("readiness"), 0);
        assert_eq!(
            plan.fleet.firewall.as_ref().map(ResourceId::as_str),
            Some("demo-vm-publiclyopened-fw-rule")
        );
    }

    #[test]
    fn test_no_ports_means_no_firewall() {
        let plan = VmFleetPlan::assemble(&ctx(), &options(&[])).unwrap();
        assert!(plan.fleet.firewall.is_none());
        assert_eq!(plan.graph.count_kind("firewall"), 0);
    }

    #[test]
    fn test_empty_fleet_opens_no_ports() {
        let empty = VmFleetOptions {
            vm_num: 0,
            ..options(&["22"])
        };
        let plan = VmFleetPlan::assemble(&ctx(), &empty).unwrap();
        assert!(plan.fleet.instances.is_empty());
        assert!(plan.fleet.firewall.is_none());
        assert_eq!(plan.graph.count_kind("firewall"), 0);
    }

    #[test]
    fn test_instances_wait_for_identity_and_network() {
        let plan = VmFleetPlan::assemble(&ctx(), &options(&["22"])).unwrap();
        for instance in &plan.fleet.instances {
            assert!(plan.graph.depends_transitively(&instance.id, &plan.fleet.identity.id));
            assert!(plan.graph.depends_transitively(&instance.id, &plan.fleet.network.id));
        }
    }
}
