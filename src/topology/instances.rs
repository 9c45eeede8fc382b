//! Instance groups: N instances sharing a machine shape, startup script and identity.

use std::collections::BTreeMap;
use tracing::debug;

use crate::core::graph::{ResourceGraph, ResourceId};
use crate::core::provider::InstanceTarget;
use crate::core::readiness::{PollSettings, ReadinessCondition};
use crate::core::resources::{AddressSpec, InstanceSpec, Resource};
use crate::errors::{LabResult, ProviderError};
use crate::topology::network::SubnetRef;

const ZONE_SUFFIXES: [char; 3] = ['c', 'b', 'a'];

/// Deterministic placement: index 0, 1, 2 land in zones c, b, a and the cycle repeats.
pub fn zone_for_index(region: &str, index: usize) -> String {
    format!("{}-{}", region, ZONE_SUFFIXES[index % ZONE_SUFFIXES.len()])
}

pub fn instance_name(lab_name: &str, role_id: &str, index: usize) -> String {
    format!("{}-{}-{}", lab_name, role_id, index)
}

/// One planned instance and the graph nodes that belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedInstance {
    pub id: ResourceId,
    pub name: String,
    pub zone: String,
    pub address: Option<ResourceId>,
}

impl ProvisionedInstance {
    pub fn target(&self, project: &str) -> InstanceTarget {
        InstanceTarget {
            project: project.to_string(),
            zone: self.zone.clone(),
            instance: self.name.clone(),
        }
    }

    /// Declare the `<name>-ready` gate on this instance's startup script.
    pub fn gate(&self, graph: &mut ResourceGraph, project: &str, poll: PollSettings) -> LabResult<ResourceId> {
        let condition = ReadinessCondition::startup_completed(self.target(project), poll);
        let id = graph.add(condition.name.clone(), Resource::Readiness(condition), [self.id.clone()])?;
        Ok(id)
    }
}

pub struct InstanceGroup<'a> {
    pub lab_name: &'a str,
    pub role_id: &'a str,
    pub region: &'a str,
    pub count: u32,
    pub machine_type: &'a str,
    pub image: &'a str,
    pub os_username: &'a str,
    pub public_key: &'a str,
    pub startup_script: &'a str,
    pub extra_metadata: &'a BTreeMap<String, String>,
    pub network: &'a str,
    pub subnets: &'a [SubnetRef],
    pub public: bool,
    pub service_identity: &'a str,
    /// Nodes every instance of the group waits for.
    pub depends_on: &'a [ResourceId],
}

impl InstanceGroup<'_> {
    /// Login metadata first, caller extras after so they may override it.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::from([
            ("enable-oslogin".to_string(), "false".to_string()),
            (
                "ssh-keys".to_string(),
                format!("{}:{}", self.os_username, self.public_key),
            ),
        ]);
        metadata.extend(self.extra_metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        metadata
    }

    pub fn provision(&self, graph: &mut ResourceGraph) -> LabResult<Vec<ProvisionedInstance>> {
        if self.subnets.is_empty() {
            return Err(ProviderError::EmptySubnetPool {
                group: format!("{}-{}", self.lab_name, self.role_id),
            }
            .into());
        }

        let metadata = self.metadata();
        let mut provisioned = Vec::with_capacity(self.count as usize);

        for index in 0..self.count as usize {
            let name = instance_name(self.lab_name, self.role_id, index);
            let zone = zone_for_index(self.region, index);
            let subnet = &self.subnets[index % self.subnets.len()];

            let mut depends_on: Vec<ResourceId> = self.depends_on.to_vec();
            depends_on.push(subnet.id.clone());

            let address = if self.public {
                let address_name = format!("{}-pub-ip", name);
                let id = graph.add(
                    address_name.clone(),
                    Resource::Address(AddressSpec {
                        name: address_name,
                        region: self.region.to_string(),
                    }),
                    self.depends_on.iter().cloned(),
                )?;
                depends_on.push(id.clone());
                Some(id)
            } else {
                None
            };

            debug!(instance = %name, zone = %zone, subnet = %subnet.name, "planning instance");
            let id = graph.add(
                name.clone(),
                Resource::Instance(InstanceSpec {
                    name: name.clone(),
                    zone: zone.clone(),
                    machine_type: self.machine_type.to_string(),
                    image: self.image.to_string(),
                    network: self.network.to_string(),
                    subnet: subnet.name.clone(),
                    service_identity: self.service_identity.to_string(),
                    startup_script: self.startup_script.to_string(),
                    metadata: metadata.clone(),
                    public_address: address.clone(),
                }),
                depends_on,
            )?;

            provisioned.push(ProvisionedInstance { id, name, zone, address });
        }

        Ok(provisioned)
    }
}
