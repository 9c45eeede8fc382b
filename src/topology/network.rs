use crate::core::graph::{ResourceGraph, ResourceId};
use crate::core::resources::{FirewallRule, NetworkSpec, Resource, RouterSpec, SubnetSpec};
use crate::errors::GraphError;

pub const ANYWHERE: &str = "0.0.0.0/0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRef {
    pub id: ResourceId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRef {
    pub id: ResourceId,
    pub name: String,
}

/// Declares the VPC, its subnets and router for one lab.
pub struct NetworkAssembler<'a> {
    lab_name: &'a str,
    region: &'a str,
    existing: Option<&'a str>,
}

impl<'a> NetworkAssembler<'a> {
    pub fn new(lab_name: &'a str, region: &'a str, existing: Option<&'a str>) -> Self {
        Self {
            lab_name,
            region,
            existing,
        }
    }

    /// `{lab}-{suffix}`, or the configured existing network which is referenced only.
    pub fn network(&self, graph: &mut ResourceGraph, suffix: &str) -> Result<NetworkRef, GraphError> {
        let (name, reuse) = match self.existing {
            Some(existing) => (existing.to_string(), true),
            None => (format!("{}-{}", self.lab_name, suffix), false),
        };
        let id = graph.add_root(
            format!("network:{}", name),
            Resource::Network(NetworkSpec {
                name: name.clone(),
                reuse,
            }),
        )?;
        Ok(NetworkRef { id, name })
    }

    pub fn subnet(
        &self,
        graph: &mut ResourceGraph,
        network: &NetworkRef,
        suffix: &str,
        ip_cidr_range: &str,
        private_google_access: bool,
    ) -> Result<SubnetRef, GraphError> {
        let name = format!("{}-{}", self.lab_name, suffix);
        let id = graph.add(
            name.clone(),
            Resource::Subnet(SubnetSpec {
                name: name.clone(),
                network: network.name.clone(),
                region: self.region.to_string(),
                ip_cidr_range: ip_cidr_range.to_string(),
                private_google_access,
            }),
            [network.id.clone()],
        )?;
        Ok(SubnetRef { id, name })
    }

    /// Cloud router plus NAT so instances without a public address reach the internet.
    pub fn nat_router(&self, graph: &mut ResourceGraph, network: &NetworkRef, prefix: &str) -> Result<ResourceId, GraphError> {
        let name = format!("{}-{}-nat-router", self.lab_name, prefix);
        graph.add(
            name.clone(),
            Resource::Router(RouterSpec {
                name,
                nat_name: format!("{}-{}-nat-gateway", self.lab_name, prefix),
                network: network.name.clone(),
                region: self.region.to_string(),
            }),
            [network.id.clone()],
        )
    }
}

/// TCP ports reachable from anywhere on instances running as `target`.
pub fn public_ports_rule(lab_name: &str, role_id: &str, network: &str, ports: &[String], target: &str) -> FirewallRule {
    FirewallRule {
        name: format!("{}-{}-publiclyopened-fw-rule", lab_name, role_id),
        network: network.to_string(),
        description: format!("Publicly reachable port for {}/{} instances", lab_name, role_id),
        protocol: "tcp".to_string(),
        allowed_ports: ports.to_vec(),
        source_ranges: vec![ANYWHERE.to_string()],
        source_identities: Vec::new(),
        target_identities: vec![target.to_string()],
    }
}

/// Unrestricted traffic among the given identities.
pub fn mesh_rule(name: String, network: &str, description: &str, identities: &[String]) -> FirewallRule {
    FirewallRule {
        name,
        network: network.to_string(),
        description: description.to_string(),
        protocol: "all".to_string(),
        allowed_ports: Vec::new(),
        source_ranges: Vec::new(),
        source_identities: identities.to_vec(),
        target_identities: identities.to_vec(),
    }
}
