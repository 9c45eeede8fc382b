use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::core::graph::ResourceId;
use crate::core::readiness::ReadinessCondition;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    /// An existing network is referenced, never created.
    pub reuse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSpec {
    pub name: String,
    pub network: String,
    pub region: String,
    pub ip_cidr_range: String,
    pub private_google_access: bool,
}

/// Cloud router with a NAT gateway so private-only nodes can reach the internet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSpec {
    pub name: String,
    pub nat_name: String,
    pub network: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub name: String,
    pub network: String,
    pub description: String,
    /// `tcp`, `udp` or `all`.
    pub protocol: String,
    pub allowed_ports: Vec<String>,
    pub source_ranges: Vec<String>,
    pub source_identities: Vec<String>,
    pub target_identities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub account_id: String,
    pub display_name: String,
    pub email: String,
}

impl ServiceIdentity {
    pub fn new(project: &str, account_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let account_id = account_id.into();
        Self {
            email: format!("{}@{}.iam.gserviceaccount.com", account_id, project),
            account_id,
            display_name: display_name.into(),
        }
    }

    pub fn member(&self) -> String {
        format!("serviceAccount:{}", self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRoleSpec {
    pub role_id: String,
    pub title: String,
    pub permissions: Vec<String>,
}

impl CustomRoleSpec {
    pub fn role_name(&self, project: &str) -> String {
        format!("projects/{}/roles/{}", project, self.role_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingScope {
    Project,
    Bucket(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IamBinding {
    pub scope: BindingScope,
    pub role: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub name: String,
    pub location: String,
    pub force_destroy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketObjectSpec {
    pub bucket: String,
    pub name: String,
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpec {
    pub name: String,
    pub region: String,
}

/// Everything needed to create one compute instance. Immutable once planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub zone: String,
    pub machine_type: String,
    pub image: String,
    pub network: String,
    pub subnet: String,
    pub service_identity: String,
    pub startup_script: String,
    pub metadata: BTreeMap<String, String>,
    /// Address node whose IP becomes the instance's NAT IP.
    pub public_address: Option<ResourceId>,
}

impl InstanceSpec {
    pub fn public_address_requested(&self) -> bool {
        self.public_address.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub name: String,
    pub zone: String,
    pub private_address: String,
    pub public_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resource {
    Network(NetworkSpec),
    Subnet(SubnetSpec),
    Router(RouterSpec),
    Firewall(FirewallRule),
    ServiceAccount(ServiceIdentity),
    CustomRole(CustomRoleSpec),
    Binding(IamBinding),
    Bucket(BucketSpec),
    BucketObject(BucketObjectSpec),
    Address(AddressSpec),
    Instance(InstanceSpec),
    Readiness(ReadinessCondition),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Network(_) => "network",
            Resource::Subnet(_) => "subnet",
            Resource::Router(_) => "router",
            Resource::Firewall(_) => "firewall",
            Resource::ServiceAccount(_) => "service-account",
            Resource::CustomRole(_) => "custom-role",
            Resource::Binding(_) => "iam-binding",
            Resource::Bucket(_) => "bucket",
            Resource::BucketObject(_) => "bucket-object",
            Resource::Address(_) => "address",
            Resource::Instance(_) => "instance",
            Resource::Readiness(_) => "readiness",
        }
    }
}
