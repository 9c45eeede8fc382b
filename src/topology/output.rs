use serde::{Deserialize, Serialize};

use crate::core::deployer::DeploymentOutputs;
use crate::core::resources::InstanceHandle;
use crate::errors::{LabResult, ProviderError};
use crate::topology::cluster_lab::ClusterPlan;
use crate::topology::instances::ProvisionedInstance;
use crate::topology::vm_fleet::VmFleetPlan;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceOutput {
    pub name: String,
    pub public_address: Option<String>,
    pub private_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmFleetOutput {
    pub instances: Vec<InstanceOutput>,
    pub private_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOutput {
    pub control_planes: Vec<String>,
    pub workers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLabOutput {
    pub access: Vec<String>,
    pub config_bucket: String,
    pub clusters: Vec<ClusterOutput>,
    pub private_key: String,
}

fn instance_handle<'a>(outputs: &'a DeploymentOutputs, instance: &ProvisionedInstance) -> LabResult<&'a InstanceHandle> {
    outputs
        .instance(&instance.id)
        .ok_or_else(|| {
            ProviderError::MissingOutput {
                resource: instance.name.clone(),
            }
            .into()
        })
}

fn public_address(handle: &InstanceHandle) -> LabResult<String> {
    handle.public_address.clone().ok_or_else(|| {
        ProviderError::MissingOutput {
            resource: format!("{} public address", handle.name),
        }
        .into()
    })
}

impl VmFleetOutput {
    pub fn collect(plan: &VmFleetPlan, outputs: &DeploymentOutputs, private_key: &str) -> LabResult<Self> {
        let instances = plan
            .fleet
            .instances
            .iter()
            .map(|instance| {
                let handle = instance_handle(outputs, instance)?;
                Ok(InstanceOutput {
                    name: handle.name.clone(),
                    public_address: handle.public_address.clone(),
                    private_address: handle.private_address.clone(),
                })
            })
            .collect::<LabResult<Vec<_>>>()?;

        Ok(Self {
            instances,
            private_key: private_key.to_string(),
        })
    }
}

impl ClusterLabOutput {
    /// Node addresses are private behind a bastion and public otherwise.
    pub fn collect(plan: &ClusterPlan, outputs: &DeploymentOutputs, private_key: &str) -> LabResult<Self> {
        let behind_bastion = plan.bastion.is_some();
        let address = |instance: &ProvisionedInstance| -> LabResult<String> {
            let handle = instance_handle(outputs, instance)?;
            if behind_bastion {
                Ok(handle.private_address.clone())
            } else {
                public_address(handle)
            }
        };

        let access = plan
            .bastion
            .iter()
            .map(|bastion| public_address(instance_handle(outputs, bastion)?))
            .collect::<LabResult<Vec<_>>>()?;

        let clusters = plan
            .clusters
            .iter()
            .map(|cluster| {
                Ok(ClusterOutput {
                    control_planes: vec![address(&cluster.control_plane)?],
                    workers: cluster.workers.iter().map(&address).collect::<LabResult<Vec<_>>>()?,
                })
            })
            .collect::<LabResult<Vec<_>>>()?;

        Ok(Self {
            access,
            config_bucket: plan.bucket_name.clone(),
            clusters,
            private_key: private_key.to_string(),
        })
    }
}
