//! Topology assemblers.
//!
//! An assembler turns validated options into a [`ResourceGraph`]: every
//! resource of one deployment shape together with the explicit edges that
//! order its creation. Nothing here talks to the cloud; the graph is handed
//! to the deployer afterwards.

pub mod cluster_lab;
pub mod instances;
pub mod network;
pub mod output;
pub mod vm_fleet;

use serde::Serialize;

use crate::config::LabOptions;
use crate::core::deployer::DeploymentOutputs;
use crate::core::graph::{ResourceGraph, ResourceId};
use crate::core::readiness::PollSettings;
use crate::core::resources::{Resource, ServiceIdentity};
use crate::errors::{GraphError, LabResult};
use crate::utils::keys::SshKeyPair;

pub use cluster_lab::{ClusterLabOptions, ClusterPlan};
pub use instances::{instance_name, zone_for_index, InstanceGroup, ProvisionedInstance};
pub use network::{NetworkAssembler, NetworkRef, SubnetRef};
pub use output::{ClusterLabOutput, VmFleetOutput};
pub use vm_fleet::{VmFleet, VmFleetOptions, VmFleetPlan};

/// Values shared by every resource of one lab.
#[derive(Debug, Clone)]
pub struct LabContext {
    pub project: String,
    pub region: String,
    pub lab_name: String,
    pub public_key: String,
    pub existing_network: Option<String>,
    pub poll: PollSettings,
}

/// A service identity already declared in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRef {
    pub id: ResourceId,
    pub identity: ServiceIdentity,
}

impl IdentityRef {
    pub fn email(&self) -> &str {
        &self.identity.email
    }

    pub fn declare<I>(
        graph: &mut ResourceGraph,
        project: &str,
        account_id: String,
        display_name: String,
        depends_on: I,
    ) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = ResourceId>,
    {
        let identity = ServiceIdentity::new(project, account_id, display_name);
        let id = graph.add(
            identity.account_id.as_str(),
            Resource::ServiceAccount(identity.clone()),
            depends_on,
        )?;
        Ok(Self { id, identity })
    }
}

/// The planned graph of whichever lab type was requested.
#[derive(Debug, Clone)]
pub enum LabPlan {
    Vm(VmFleetPlan),
    K8s(ClusterPlan),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LabOutput {
    Vm(VmFleetOutput),
    K8s(ClusterLabOutput),
}

impl LabPlan {
    pub async fn assemble(ctx: &LabContext, options: &LabOptions, keys: &SshKeyPair) -> LabResult<Self> {
        match options {
            LabOptions::Vm(vm) => Ok(LabPlan::Vm(VmFleetPlan::assemble(ctx, vm)?)),
            LabOptions::K8s(k8s) => Ok(LabPlan::K8s(ClusterPlan::assemble(ctx, k8s, keys).await?)),
        }
    }

    pub fn graph(&self) -> &ResourceGraph {
        match self {
            LabPlan::Vm(plan) => &plan.graph,
            LabPlan::K8s(plan) => &plan.graph,
        }
    }

    pub fn output(&self, outputs: &DeploymentOutputs, private_key: &str) -> LabResult<LabOutput> {
        match self {
            LabPlan::Vm(plan) => Ok(LabOutput::Vm(VmFleetOutput::collect(plan, outputs, private_key)?)),
            LabPlan::K8s(plan) => Ok(LabOutput::K8s(ClusterLabOutput::collect(plan, outputs, private_key)?)),
        }
    }
}
