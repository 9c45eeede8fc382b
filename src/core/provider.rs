use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::core::resources::{
    AddressSpec, BucketObjectSpec, BucketSpec, CustomRoleSpec, FirewallRule, IamBinding,
    InstanceHandle, InstanceSpec, NetworkSpec, RouterSpec, ServiceIdentity, SubnetSpec,
};
use crate::errors::ProviderError;

/// Coordinates of the instance a guest attribute is read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceTarget {
    pub project: String,
    pub zone: String,
    pub instance: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestAttribute {
    #[serde(default)]
    pub namespace: String,
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributeQueryError {
    /// The guest has not published anything under the path yet.
    #[error("guest attribute not found")]
    NotFound,
    #[error("status {status}: {message}")]
    Api { status: u16, message: String },
}

/// Read side of the instance guest-attribute channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GuestAttributes: Send + Sync {
    async fn query(
        &self,
        target: &InstanceTarget,
        query_path: &str,
    ) -> Result<Vec<GuestAttribute>, AttributeQueryError>;
}

/// Declarative resource creation against one cloud project.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), ProviderError>;

    async fn create_subnet(&self, spec: &SubnetSpec) -> Result<(), ProviderError>;

    async fn create_router(&self, spec: &RouterSpec) -> Result<(), ProviderError>;

    async fn create_firewall(&self, rule: &FirewallRule) -> Result<(), ProviderError>;

    /// Returns the account email.
    async fn create_service_account(&self, spec: &ServiceIdentity) -> Result<String, ProviderError>;

    /// Returns the fully qualified role name.
    async fn create_custom_role(&self, spec: &CustomRoleSpec) -> Result<String, ProviderError>;

    async fn add_binding(&self, binding: &IamBinding) -> Result<(), ProviderError>;

    async fn create_bucket(&self, spec: &BucketSpec) -> Result<(), ProviderError>;

    async fn upload_object(&self, spec: &BucketObjectSpec) -> Result<(), ProviderError>;

    /// Reserves an external address and returns its IP.
    async fn create_address(&self, spec: &AddressSpec) -> Result<String, ProviderError>;

    async fn create_instance(
        &self,
        spec: &InstanceSpec,
        nat_ip: Option<String>,
    ) -> Result<InstanceHandle, ProviderError>;
}
