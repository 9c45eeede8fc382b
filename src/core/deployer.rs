use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::graph::{ResourceGraph, ResourceId, ResourceNode};
use crate::core::provider::{CloudProvider, GuestAttributes};
use crate::core::readiness::{wait_for_guest_attribute, ReadyMarker};
use crate::core::resources::{InstanceHandle, Resource};
use crate::errors::{LabError, LabResult, ProviderError};
use crate::monitoring::{DeploymentProgress, InstanceState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ResourceOutput {
    Created,
    ServiceAccount { email: String },
    Role { name: String },
    Address { ip: String },
    Instance(InstanceHandle),
    Ready(ReadyMarker),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DeploymentOutputs {
    outputs: BTreeMap<ResourceId, ResourceOutput>,
}

impl DeploymentOutputs {
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceOutput> {
        self.outputs.get(id)
    }

    pub fn instance(&self, id: &ResourceId) -> Option<&InstanceHandle> {
        match self.outputs.get(id) {
            Some(ResourceOutput::Instance(handle)) => Some(handle),
            _ => None,
        }
    }

    pub fn address(&self, id: &ResourceId) -> Option<&str> {
        match self.outputs.get(id) {
            Some(ResourceOutput::Address { ip }) => Some(ip),
            _ => None,
        }
    }

    pub fn ready_markers(&self) -> impl Iterator<Item = &ReadyMarker> {
        self.outputs.values().filter_map(|o| match o {
            ResourceOutput::Ready(marker) => Some(marker),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Executes a resource graph: each node starts once all of its dependencies
/// completed, independent nodes run concurrently, and the first failure stops
/// everything so no dependent of a failed node is ever created.
pub struct Deployer<P: ?Sized, G: ?Sized> {
    provider: Arc<P>,
    guest: Arc<G>,
    progress: DeploymentProgress,
}

impl<P, G> Deployer<P, G>
where
    P: CloudProvider + ?Sized + 'static,
    G: GuestAttributes + ?Sized + 'static,
{
    pub fn new(provider: Arc<P>, guest: Arc<G>) -> Self {
        Self {
            provider,
            guest,
            progress: DeploymentProgress::new(),
        }
    }

    pub fn progress(&self) -> &DeploymentProgress {
        &self.progress
    }

    pub async fn deploy(&self, graph: &ResourceGraph, cancel: &CancellationToken) -> LabResult<DeploymentOutputs> {
        info!("Deploying {} resources", graph.len());

        let gated: Arc<HashSet<String>> = Arc::new(
            graph
                .readiness_conditions()
                .map(|(_, c)| c.target.instance.clone())
                .collect(),
        );
        for (_, spec) in graph.instances() {
            self.progress.register(&spec.name).await;
        }

        let mut dependents: BTreeMap<&ResourceId, Vec<&ResourceNode>> = BTreeMap::new();
        let mut waiting_on: BTreeMap<&ResourceId, usize> = BTreeMap::new();
        for node in graph.iter() {
            waiting_on.insert(&node.id, node.depends_on.len());
            for dep in &node.depends_on {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let run = cancel.child_token();
        let mut tasks = JoinSet::new();
        let mut outputs = DeploymentOutputs::default();

        for node in graph.iter().filter(|n| n.depends_on.is_empty()) {
            self.spawn(&mut tasks, node, &outputs, &run, &gated)?;
        }

        while let Some(joined) = tasks.join_next().await {
            let (id, result) = match joined {
                Ok(done) => done,
                Err(join_error) => {
                    run.cancel();
                    tasks.shutdown().await;
                    return Err(LabError::SystemError(std::io::Error::other(join_error.to_string())));
                }
            };

            let output = match result {
                Ok(output) => output,
                Err(e) => {
                    error!(resource = %id, error = %e, "resource failed, aborting deployment");
                    run.cancel();
                    tasks.shutdown().await;
                    return Err(e);
                }
            };
            outputs.outputs.insert(id.clone(), output);

            for dependent in dependents.get(&id).map(Vec::as_slice).unwrap_or_default() {
                let Some(remaining) = waiting_on.get_mut(&dependent.id) else {
                    continue;
                };
                *remaining -= 1;
                if *remaining == 0 {
                    self.spawn(&mut tasks, dependent, &outputs, &run, &gated)?;
                }
            }
        }

        if cancel.is_cancelled() || outputs.len() != graph.len() {
            return Err(LabError::Cancelled);
        }

        info!(
            "Deployment complete: {} resources, {} readiness gates satisfied",
            outputs.len(),
            outputs.ready_markers().count()
        );
        Ok(outputs)
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<(ResourceId, LabResult<ResourceOutput>)>,
        node: &ResourceNode,
        outputs: &DeploymentOutputs,
        run: &CancellationToken,
        gated: &Arc<HashSet<String>>,
    ) -> LabResult<()> {
        let nat_ip = match &node.resource {
            Resource::Instance(spec) => match &spec.public_address {
                Some(address) => Some(
                    outputs
                        .address(address)
                        .ok_or_else(|| ProviderError::MissingOutput {
                            resource: address.to_string(),
                        })?
                        .to_string(),
                ),
                None => None,
            },
            _ => None,
        };

        let id = node.id.clone();
        let resource = node.resource.clone();
        let provider = Arc::clone(&self.provider);
        let guest = Arc::clone(&self.guest);
        let progress = self.progress.clone();
        let gated = Arc::clone(gated);
        let token = run.clone();

        tasks.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(LabError::Cancelled),
                result = create(&*provider, &*guest, &progress, resource, nat_ip, &gated, &token) => result,
            };
            (id, result)
        });
        Ok(())
    }
}

async fn create<P, G>(
    provider: &P,
    guest: &G,
    progress: &DeploymentProgress,
    resource: Resource,
    nat_ip: Option<String>,
    gated: &HashSet<String>,
    cancel: &CancellationToken,
) -> LabResult<ResourceOutput>
where
    P: CloudProvider + ?Sized,
    G: GuestAttributes + ?Sized,
{
    let output = match resource {
        Resource::Network(spec) => {
            provider.create_network(&spec).await?;
            ResourceOutput::Created
        }
        Resource::Subnet(spec) => {
            provider.create_subnet(&spec).await?;
            ResourceOutput::Created
        }
        Resource::Router(spec) => {
            provider.create_router(&spec).await?;
            ResourceOutput::Created
        }
        Resource::Firewall(rule) => {
            provider.create_firewall(&rule).await?;
            ResourceOutput::Created
        }
        Resource::ServiceAccount(spec) => ResourceOutput::ServiceAccount {
            email: provider.create_service_account(&spec).await?,
        },
        Resource::CustomRole(spec) => ResourceOutput::Role {
            name: provider.create_custom_role(&spec).await?,
        },
        Resource::Binding(binding) => {
            provider.add_binding(&binding).await?;
            ResourceOutput::Created
        }
        Resource::Bucket(spec) => {
            provider.create_bucket(&spec).await?;
            ResourceOutput::Created
        }
        Resource::BucketObject(spec) => {
            provider.upload_object(&spec).await?;
            ResourceOutput::Created
        }
        Resource::Address(spec) => ResourceOutput::Address {
            ip: provider.create_address(&spec).await?,
        },
        Resource::Instance(spec) => {
            progress.transition(&spec.name, InstanceState::Provisioning).await?;
            match provider.create_instance(&spec, nat_ip).await {
                Ok(handle) => {
                    let next = if gated.contains(&spec.name) {
                        InstanceState::WaitingReady
                    } else {
                        InstanceState::Ready
                    };
                    progress.transition(&spec.name, next).await?;
                    ResourceOutput::Instance(handle)
                }
                Err(e) => {
                    progress.transition(&spec.name, InstanceState::Failed).await?;
                    return Err(e.into());
                }
            }
        }
        Resource::Readiness(condition) => {
            let instance = condition.target.instance.clone();
            // conditions may gate instances created outside this graph
            let tracked = progress.state(&instance).await.is_some();
            match wait_for_guest_attribute(guest, &condition, cancel).await {
                Ok(marker) => {
                    if tracked {
                        progress.transition(&instance, InstanceState::Ready).await?;
                    }
                    ResourceOutput::Ready(marker)
                }
                Err(e) => {
                    if tracked {
                        progress.transition(&instance, InstanceState::Failed).await?;
                    }
                    return Err(e.into());
                }
            }
        }
    };
    Ok(output)
}
