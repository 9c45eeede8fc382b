use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::core::provider::{AttributeQueryError, CloudProvider, GuestAttribute, GuestAttributes, InstanceTarget};
use crate::core::readiness::STARTUP_COMPLETED;
use crate::core::resources::{
    AddressSpec, BucketObjectSpec, BucketSpec, CustomRoleSpec, FirewallRule, IamBinding, InstanceHandle,
    InstanceSpec, NetworkSpec, RouterSpec, ServiceIdentity, SubnetSpec,
};
use crate::errors::ProviderError;

/// What a simulated guest publishes: nothing for `absent_polls` queries, then `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestScript {
    pub absent_polls: u32,
    pub value: String,
}

impl GuestScript {
    pub fn completes_after(absent_polls: u32) -> Self {
        Self {
            absent_polls,
            value: STARTUP_COMPLETED.to_string(),
        }
    }

    pub fn reports(absent_polls: u32, value: impl Into<String>) -> Self {
        Self {
            absent_polls,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    Network(NetworkSpec),
    Subnet(SubnetSpec),
    Router(RouterSpec),
    Firewall(FirewallRule),
    ServiceAccount(ServiceIdentity),
    CustomRole(CustomRoleSpec),
    Binding(IamBinding),
    Bucket(BucketSpec),
    Object(BucketObjectSpec),
    Address(AddressSpec),
    Instance { spec: InstanceSpec, nat_ip: Option<String> },
    GuestQuery { instance: String, query_path: String },
}

/// In-memory cloud that records every call in order. Used for dry runs and tests.
pub struct SimulatedCloud {
    project: String,
    default_script: GuestScript,
    scripts: Mutex<HashMap<String, GuestScript>>,
    polls: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<ProviderCall>>,
    hosts: AtomicU32,
    addresses: AtomicU32,
}

impl SimulatedCloud {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            default_script: GuestScript::completes_after(0),
            scripts: Mutex::new(HashMap::new()),
            polls: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            hosts: AtomicU32::new(2),
            addresses: AtomicU32::new(10),
        }
    }

    pub fn with_default_script(mut self, script: GuestScript) -> Self {
        self.default_script = script;
        self
    }

    pub fn with_script(self, instance: impl Into<String>, script: GuestScript) -> Self {
        self.lock_scripts().insert(instance.into(), script);
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock_calls().clone()
    }

    pub fn instances(&self) -> Vec<(InstanceSpec, Option<String>)> {
        self.lock_calls()
            .iter()
            .filter_map(|c| match c {
                ProviderCall::Instance { spec, nat_ip } => Some((spec.clone(), nat_ip.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn firewalls(&self) -> Vec<FirewallRule> {
        self.lock_calls()
            .iter()
            .filter_map(|c| match c {
                ProviderCall::Firewall(rule) => Some(rule.clone()),
                _ => None,
            })
            .collect()
    }

    /// Position of the first call matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&ProviderCall) -> bool) -> Option<usize> {
        self.lock_calls().iter().position(predicate)
    }

    /// Position of the last call matching `predicate`.
    pub fn last_position(&self, predicate: impl Fn(&ProviderCall) -> bool) -> Option<usize> {
        self.lock_calls().iter().rposition(predicate)
    }

    pub fn polls_of(&self, instance: &str) -> u32 {
        self.lock_polls().get(instance).copied().unwrap_or(0)
    }

    fn record(&self, call: ProviderCall) {
        debug!(?call, "simulated provider call");
        self.lock_calls().push(call);
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<ProviderCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, HashMap<String, GuestScript>> {
        self.scripts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_polls(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.polls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CloudProvider for SimulatedCloud {
    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), ProviderError> {
        self.record(ProviderCall::Network(spec.clone()));
        Ok(())
    }

    async fn create_subnet(&self, spec: &SubnetSpec) -> Result<(), ProviderError> {
        self.record(ProviderCall::Subnet(spec.clone()));
        Ok(())
    }

    async fn create_router(&self, spec: &RouterSpec) -> Result<(), ProviderError> {
        self.record(ProviderCall::Router(spec.clone()));
        Ok(())
    }

    async fn create_firewall(&self, rule: &FirewallRule) -> Result<(), ProviderError> {
        self.record(ProviderCall::Firewall(rule.clone()));
        Ok(())
    }

    async fn create_service_account(&self, spec: &ServiceIdentity) -> Result<String, ProviderError> {
        self.record(ProviderCall::ServiceAccount(spec.clone()));
        Ok(spec.email.clone())
    }

    async fn create_custom_role(&self, spec: &CustomRoleSpec) -> Result<String, ProviderError> {
        self.record(ProviderCall::CustomRole(spec.clone()));
        Ok(spec.role_name(&self.project))
    }

    async fn add_binding(&self, binding: &IamBinding) -> Result<(), ProviderError> {
        self.record(ProviderCall::Binding(binding.clone()));
        Ok(())
    }

    async fn create_bucket(&self, spec: &BucketSpec) -> Result<(), ProviderError> {
        self.record(ProviderCall::Bucket(spec.clone()));
        Ok(())
    }

    async fn upload_object(&self, spec: &BucketObjectSpec) -> Result<(), ProviderError> {
        self.record(ProviderCall::Object(spec.clone()));
        Ok(())
    }

    async fn create_address(&self, spec: &AddressSpec) -> Result<String, ProviderError> {
        self.record(ProviderCall::Address(spec.clone()));
        let n = self.addresses.fetch_add(1, Ordering::SeqCst);
        Ok(format!("34.0.{}.{}", n / 250, n % 250 + 1))
    }

    async fn create_instance(&self, spec: &InstanceSpec, nat_ip: Option<String>) -> Result<InstanceHandle, ProviderError> {
        self.record(ProviderCall::Instance {
            spec: spec.clone(),
            nat_ip: nat_ip.clone(),
        });
        let n = self.hosts.fetch_add(1, Ordering::SeqCst);
        Ok(InstanceHandle {
            name: spec.name.clone(),
            zone: spec.zone.clone(),
            private_address: format!("192.168.{}.{}", n / 250, n % 250 + 2),
            public_address: nat_ip,
        })
    }
}

#[async_trait]
impl GuestAttributes for SimulatedCloud {
    async fn query(&self, target: &InstanceTarget, query_path: &str) -> Result<Vec<GuestAttribute>, AttributeQueryError> {
        self.record(ProviderCall::GuestQuery {
            instance: target.instance.clone(),
            query_path: query_path.to_string(),
        });

        let seen = {
            let mut polls = self.lock_polls();
            let count = polls.entry(target.instance.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let script = self
            .lock_scripts()
            .get(&target.instance)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());

        if seen <= script.absent_polls {
            return Err(AttributeQueryError::NotFound);
        }
        let (namespace, key) = query_path.rsplit_once('/').unwrap_or(("", query_path));
        Ok(vec![GuestAttribute {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: script.value,
        }])
    }
}
