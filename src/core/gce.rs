//! Google Compute Engine over its JSON REST APIs.
//!
//! Compute, IAM, Cloud Resource Manager and Cloud Storage are all plain
//! bearer-token REST endpoints. Compute mutations return long-running
//! operations which are waited on before a resource counts as created.
//! Creating something that already exists (409) is treated as reuse.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::core::credentials::{CredentialSource, TokenProvider, CLOUD_PLATFORM_SCOPE};
use crate::core::provider::{AttributeQueryError, CloudProvider, GuestAttribute, GuestAttributes, InstanceTarget};
use crate::core::resources::{
    AddressSpec, BindingScope, BucketObjectSpec, BucketSpec, CustomRoleSpec, FirewallRule, IamBinding,
    InstanceHandle, InstanceSpec, NetworkSpec, RouterSpec, ServiceIdentity, SubnetSpec,
};
use crate::errors::ProviderError;

const COMPUTE: &str = "https://compute.googleapis.com/compute/v1";
const IAM: &str = "https://iam.googleapis.com/v1";
const RESOURCE_MANAGER: &str = "https://cloudresourcemanager.googleapis.com/v1";
const STORAGE: &str = "https://storage.googleapis.com/storage/v1";
const STORAGE_UPLOAD: &str = "https://storage.googleapis.com/upload/storage/v1";

pub struct GceClient {
    http: reqwest::Client,
    tokens: TokenProvider,
    project: String,
}

impl GceClient {
    pub fn new(project: impl Into<String>, credentials: CredentialSource) -> Self {
        let http = reqwest::Client::new();
        Self {
            tokens: TokenProvider::new(http.clone(), credentials),
            http,
            project: project.into(),
        }
    }

    fn compute(&self, path: &str) -> String {
        format!("{}/projects/{}/{}", COMPUTE, self.project, path)
    }

    async fn send(&self, resource: &str, request: RequestBuilder) -> Result<Response, ProviderError> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(ProviderError::Api {
            resource: resource.to_string(),
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }

    async fn get_json(&self, resource: &str, url: &str) -> Result<Value, ProviderError> {
        Ok(self.send(resource, self.http.get(url)).await?.json().await?)
    }

    async fn post_json(&self, resource: &str, url: &str, body: &Value) -> Result<Value, ProviderError> {
        Ok(self.send(resource, self.http.post(url).json(body)).await?.json().await?)
    }

    /// POST a compute resource and wait for its operation; 409 means it exists already.
    async fn insert(&self, resource: &str, url: &str, body: &Value) -> Result<(), ProviderError> {
        debug!(resource, url, "inserting compute resource");
        match self.post_json(resource, url, body).await {
            Ok(operation) => self.wait_operation(resource, operation).await,
            Err(ProviderError::Api { status: 409, .. }) => {
                info!("{} already exists, reusing it", resource);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_operation(&self, resource: &str, mut operation: Value) -> Result<(), ProviderError> {
        loop {
            if operation["status"] == "DONE" {
                return match operation_error(&operation) {
                    Some(message) => Err(ProviderError::Operation {
                        resource: resource.to_string(),
                        message,
                    }),
                    None => Ok(()),
                };
            }
            let self_link = operation["selfLink"].as_str().ok_or_else(|| ProviderError::Operation {
                resource: resource.to_string(),
                message: "operation without selfLink".to_string(),
            })?;
            let wait_url = format!("{}/wait", self_link);
            operation = self.post_json(resource, &wait_url, &json!({})).await?;
        }
    }

    async fn merge_policy_binding(&self, binding: &IamBinding) -> Result<(), ProviderError> {
        let resource = format!("binding {}", binding.role);
        match &binding.scope {
            BindingScope::Project => {
                let base = format!("{}/projects/{}", RESOURCE_MANAGER, self.project);
                let mut policy = self
                    .post_json(&resource, &format!("{}:getIamPolicy", base), &json!({}))
                    .await?;
                merge_binding(&mut policy, &binding.role, &binding.members);
                self.post_json(&resource, &format!("{}:setIamPolicy", base), &json!({ "policy": policy }))
                    .await?;
            }
            BindingScope::Bucket(bucket) => {
                let url = format!("{}/b/{}/iam", STORAGE, bucket);
                let mut policy = self.get_json(&resource, &url).await?;
                merge_binding(&mut policy, &binding.role, &binding.members);
                self.send(&resource, self.http.put(&url).json(&policy)).await?;
            }
        }
        Ok(())
    }
}

fn operation_error(operation: &Value) -> Option<String> {
    let errors = operation["error"]["errors"].as_array()?;
    let messages: Vec<&str> = errors.iter().filter_map(|e| e["message"].as_str()).collect();
    Some(if messages.is_empty() {
        "unknown operation error".to_string()
    } else {
        messages.join("; ")
    })
}

fn network_link(project: &str, network: &str) -> String {
    format!("projects/{}/global/networks/{}", project, network)
}

fn region_of_zone(zone: &str) -> &str {
    zone.rsplit_once('-').map(|(region, _)| region).unwrap_or(zone)
}

/// Short image names resolve to the family in the matching public image project.
pub fn image_link(project: &str, image: &str) -> String {
    if image.contains('/') {
        return image.to_string();
    }
    let public = [
        ("ubuntu-", "ubuntu-os-cloud"),
        ("debian-", "debian-cloud"),
        ("rocky-linux-", "rocky-linux-cloud"),
        ("centos-", "centos-cloud"),
        ("cos-", "cos-cloud"),
    ];
    let owner = public
        .iter()
        .find(|(prefix, _)| image.starts_with(prefix))
        .map(|(_, owner)| *owner)
        .unwrap_or(project);
    format!("projects/{}/global/images/family/{}", owner, image)
}

/// Add members to the role's binding, creating the binding when absent.
pub fn merge_binding(policy: &mut Value, role: &str, members: &[String]) {
    if !policy["bindings"].is_array() {
        policy["bindings"] = json!([]);
    }
    let Some(bindings) = policy["bindings"].as_array_mut() else {
        return;
    };
    let index = match bindings.iter().position(|b| b["role"] == role) {
        Some(index) => index,
        None => {
            bindings.push(json!({ "role": role, "members": [] }));
            bindings.len() - 1
        }
    };
    let entry = &mut bindings[index];
    if !entry["members"].is_array() {
        entry["members"] = json!([]);
    }
    if let Some(existing) = entry["members"].as_array_mut() {
        for member in members {
            if !existing.iter().any(|m| m == member.as_str()) {
                existing.push(json!(member));
            }
        }
    }
}

pub fn firewall_body(project: &str, rule: &FirewallRule) -> Value {
    let mut allowed = json!({ "IPProtocol": rule.protocol });
    if !rule.allowed_ports.is_empty() {
        allowed["ports"] = json!(rule.allowed_ports);
    }
    let mut body = json!({
        "name": rule.name,
        "network": network_link(project, &rule.network),
        "description": rule.description,
        "allowed": [allowed],
        "targetServiceAccounts": rule.target_identities,
    });
    if !rule.source_ranges.is_empty() {
        body["sourceRanges"] = json!(rule.source_ranges);
    }
    if !rule.source_identities.is_empty() {
        body["sourceServiceAccounts"] = json!(rule.source_identities);
    }
    body
}

pub fn instance_body(project: &str, spec: &InstanceSpec, nat_ip: Option<&str>) -> Value {
    let region = region_of_zone(&spec.zone);
    let mut interface = json!({
        "network": network_link(project, &spec.network),
        "subnetwork": format!("projects/{}/regions/{}/subnetworks/{}", project, region, spec.subnet),
    });
    if let Some(ip) = nat_ip {
        interface["accessConfigs"] = json!([{ "name": "External NAT", "type": "ONE_TO_ONE_NAT", "natIP": ip }]);
    }

    let mut items: Vec<Value> = spec
        .metadata
        .iter()
        .map(|(key, value)| json!({ "key": key, "value": value }))
        .collect();
    if !spec.startup_script.is_empty() {
        items.push(json!({ "key": "startup-script", "value": spec.startup_script }));
    }

    json!({
        "name": spec.name,
        "machineType": format!("zones/{}/machineTypes/{}", spec.zone, spec.machine_type),
        "networkInterfaces": [interface],
        "disks": [{
            "boot": true,
            "autoDelete": true,
            "initializeParams": {
                "sourceImage": image_link(project, &spec.image),
                "architecture": "X86_64",
            },
        }],
        "metadata": { "items": items },
        "serviceAccounts": [{
            "email": spec.service_identity,
            "scopes": [CLOUD_PLATFORM_SCOPE],
        }],
    })
}

pub fn parse_guest_attributes(body: &Value) -> Vec<GuestAttribute> {
    body["queryValue"]["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl CloudProvider for GceClient {
    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), ProviderError> {
        let resource = format!("network {}", spec.name);
        if spec.reuse {
            self.get_json(&resource, &self.compute(&format!("global/networks/{}", spec.name)))
                .await?;
            info!("Reusing existing network {}", spec.name);
            return Ok(());
        }
        let body = json!({ "name": spec.name, "autoCreateSubnetworks": false });
        self.insert(&resource, &self.compute("global/networks"), &body).await
    }

    async fn create_subnet(&self, spec: &SubnetSpec) -> Result<(), ProviderError> {
        let body = json!({
            "name": spec.name,
            "network": network_link(&self.project, &spec.network),
            "ipCidrRange": spec.ip_cidr_range,
            "region": spec.region,
            "privateIpGoogleAccess": spec.private_google_access,
        });
        let url = self.compute(&format!("regions/{}/subnetworks", spec.region));
        self.insert(&format!("subnet {}", spec.name), &url, &body).await
    }

    async fn create_router(&self, spec: &RouterSpec) -> Result<(), ProviderError> {
        let body = json!({
            "name": spec.name,
            "network": network_link(&self.project, &spec.network),
            "nats": [{
                "name": spec.nat_name,
                "sourceSubnetworkIpRangesToNat": "ALL_SUBNETWORKS_ALL_IP_RANGES",
                "natIpAllocateOption": "AUTO_ONLY",
            }],
        });
        let url = self.compute(&format!("regions/{}/routers", spec.region));
        self.insert(&format!("router {}", spec.name), &url, &body).await
    }

    async fn create_firewall(&self, rule: &FirewallRule) -> Result<(), ProviderError> {
        let body = firewall_body(&self.project, rule);
        self.insert(&format!("firewall {}", rule.name), &self.compute("global/firewalls"), &body)
            .await
    }

    async fn create_service_account(&self, spec: &ServiceIdentity) -> Result<String, ProviderError> {
        let url = format!("{}/projects/{}/serviceAccounts", IAM, self.project);
        let body = json!({
            "accountId": spec.account_id,
            "serviceAccount": { "displayName": spec.display_name },
        });
        match self.post_json(&format!("service account {}", spec.account_id), &url, &body).await {
            Ok(account) => Ok(account["email"].as_str().unwrap_or(&spec.email).to_string()),
            Err(ProviderError::Api { status: 409, .. }) => Ok(spec.email.clone()),
            Err(e) => Err(e),
        }
    }

    async fn create_custom_role(&self, spec: &CustomRoleSpec) -> Result<String, ProviderError> {
        let url = format!("{}/projects/{}/roles", IAM, self.project);
        let body = json!({
            "roleId": spec.role_id,
            "role": {
                "title": spec.title,
                "includedPermissions": spec.permissions,
                "stage": "GA",
            },
        });
        match self.post_json(&format!("role {}", spec.role_id), &url, &body).await {
            Ok(role) => Ok(role["name"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| spec.role_name(&self.project))),
            Err(ProviderError::Api { status: 409, .. }) => Ok(spec.role_name(&self.project)),
            Err(e) => Err(e),
        }
    }

    async fn add_binding(&self, binding: &IamBinding) -> Result<(), ProviderError> {
        self.merge_policy_binding(binding).await
    }

    async fn create_bucket(&self, spec: &BucketSpec) -> Result<(), ProviderError> {
        let url = format!("{}/b?project={}", STORAGE, self.project);
        let body = json!({ "name": spec.name, "location": spec.location });
        match self.post_json(&format!("bucket {}", spec.name), &url, &body).await {
            Ok(_) | Err(ProviderError::Api { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn upload_object(&self, spec: &BucketObjectSpec) -> Result<(), ProviderError> {
        let resource = format!("object {}/{}", spec.bucket, spec.name);
        let bytes = tokio::fs::read(&spec.source)
            .await
            .map_err(|e| ProviderError::Operation {
                resource: resource.clone(),
                message: format!("cannot read {}: {}", spec.source.display(), e),
            })?;
        let request = self
            .http
            .post(format!("{}/b/{}/o", STORAGE_UPLOAD, spec.bucket))
            .query(&[("uploadType", "media"), ("name", spec.name.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        self.send(&resource, request).await?;
        Ok(())
    }

    async fn create_address(&self, spec: &AddressSpec) -> Result<String, ProviderError> {
        let resource = format!("address {}", spec.name);
        let collection = self.compute(&format!("regions/{}/addresses", spec.region));
        let body = json!({ "name": spec.name, "addressType": "EXTERNAL", "ipVersion": "IPV4" });
        self.insert(&resource, &collection, &body).await?;

        let address = self
            .get_json(&resource, &format!("{}/{}", collection, spec.name))
            .await?;
        address["address"]
            .as_str()
            .map(str::to_string)
            .ok_or(ProviderError::MissingOutput { resource })
    }

    async fn create_instance(&self, spec: &InstanceSpec, nat_ip: Option<String>) -> Result<InstanceHandle, ProviderError> {
        let resource = format!("instance {}", spec.name);
        let collection = self.compute(&format!("zones/{}/instances", spec.zone));
        let body = instance_body(&self.project, spec, nat_ip.as_deref());
        self.insert(&resource, &collection, &body).await?;

        let instance = self
            .get_json(&resource, &format!("{}/{}", collection, spec.name))
            .await?;
        let interface = &instance["networkInterfaces"][0];
        let private_address = interface["networkIP"]
            .as_str()
            .ok_or_else(|| ProviderError::MissingOutput {
                resource: resource.clone(),
            })?
            .to_string();
        info!("Instance {} is up at {}", spec.name, private_address);

        Ok(InstanceHandle {
            name: spec.name.clone(),
            zone: spec.zone.clone(),
            private_address,
            public_address: interface["accessConfigs"][0]["natIP"].as_str().map(str::to_string),
        })
    }
}

#[async_trait]
impl GuestAttributes for GceClient {
    async fn query(&self, target: &InstanceTarget, query_path: &str) -> Result<Vec<GuestAttribute>, AttributeQueryError> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| AttributeQueryError::Api {
                status: StatusCode::UNAUTHORIZED.as_u16(),
                message: e.to_string(),
            })?;

        let url = format!(
            "{}/projects/{}/zones/{}/instances/{}/getGuestAttributes",
            COMPUTE, target.project, target.zone, target.instance
        );
        let response = self
            .http
            .get(url)
            .query(&[("queryPath", query_path)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AttributeQueryError::Api {
                status: e.status().map(|s| s.as_u16()).unwrap_or_default(),
                message: e.to_string(),
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(AttributeQueryError::NotFound),
            status if status.is_success() => {
                let body: Value = response.json().await.map_err(|e| AttributeQueryError::Api {
                    status: status.as_u16(),
                    message: e.to_string(),
                })?;
                Ok(parse_guest_attributes(&body))
            }
            status => Err(AttributeQueryError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}
