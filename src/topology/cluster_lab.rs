//! Kubernetes lab: optional bastion, then control planes, then one worker group
//! per control plane. Every stage boundary is a readiness gate on the previous
//! stage's startup script, and everything after the bastion waits for it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::graph::{ResourceGraph, ResourceId};
use crate::core::resources::{BindingScope, BucketObjectSpec, BucketSpec, CustomRoleSpec, IamBinding, Resource};
use crate::errors::{LabResult, ProviderError};
use crate::topology::instances::ProvisionedInstance;
use crate::topology::network::{mesh_rule, NetworkAssembler, NetworkRef, SubnetRef};
use crate::topology::vm_fleet::{VmFleet, VmFleetOptions};
use crate::topology::{IdentityRef, LabContext};
use crate::utils::keys::{SshKeyPair, PRIVATE_KEY_FILE};
use crate::utils::template::{render, TemplateParams};

pub const REMOTE_CONFIG_DIR: &str = "K8S/remote";
pub const BASTION_SCRIPT: &str = "K8S/userData/bastion.sh";
pub const NODE_SCRIPT: &str = "K8S/userData/k8s.sh";

/// Read access to the config bucket and to instance details and guest attributes.
pub const LAB_NODE_PERMISSIONS: [&str; 5] = [
    "storage.objects.get",
    "storage.objects.list",
    "compute.instances.get",
    "compute.instances.list",
    "compute.instances.getGuestAttributes",
];

/// Access nodes are reached through consecutive bastion ports from here.
pub const FIRST_ACCESS_PORT: u32 = 8080;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLabOptions {
    pub bastion: bool,
    pub access_num: u32,
    pub clusters_num: u32,
    pub workers_num: u32,
    pub cluster_ready: bool,
    pub k8s_version: String,
    pub etcd_version: String,
    pub cilium_version: String,
    pub access_psw: String,
    pub os_username: String,
    pub vm_type: String,
    pub bastion_vm_type: String,
    pub image: String,
    pub config_dir: PathBuf,
    pub bucket_suffix: Option<u32>,
}

impl ClusterLabOptions {
    /// SSH plus one port per access node and one for the lab console.
    pub fn bastion_ports(&self) -> Vec<String> {
        std::iter::once("22".to_string())
            .chain((FIRST_ACCESS_PORT..=FIRST_ACCESS_PORT.saturating_add(self.access_num)).map(|p| p.to_string()))
            .collect()
    }

    fn node_ports(&self, with_bastion: &[&str]) -> Vec<String> {
        if self.bastion {
            with_bastion.iter().map(|p| p.to_string()).collect()
        } else {
            vec!["80".into(), "443".into(), "22".into()]
        }
    }

    fn bastion_params(&self, lab_name: &str) -> TemplateParams {
        TemplateParams::from([
            ("ACCESS_PSW", self.access_psw.clone()),
            ("LAB_NAME", lab_name.to_string()),
            ("CLUSTERS_NUM", self.clusters_num.to_string()),
            ("OS_USERNAME", self.os_username.clone()),
            ("K8S_VERSION", self.k8s_version.clone()),
            ("ACCESS_NUM", self.access_num.to_string()),
            ("CLUSTER_READY", self.cluster_ready.to_string()),
        ])
    }

    fn node_params(&self, role: &str, control_plane: Option<&str>) -> TemplateParams {
        let mut params = TemplateParams::from([
            ("K8S_VERSION", self.k8s_version.clone()),
            ("ETCD_VERSION", self.etcd_version.clone()),
            ("CILIUM_VERSION", self.cilium_version.clone()),
            ("K8S_ROLE", role.to_string()),
            ("CLUSTER_READY", self.cluster_ready.to_string()),
        ]);
        if let Some(cp) = control_plane {
            params.insert("CP_NAME", cp.to_string());
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNodes {
    pub control_plane: ProvisionedInstance,
    pub control_plane_gate: ResourceId,
    pub workers: Vec<ProvisionedInstance>,
}

#[derive(Debug, Clone)]
pub struct ClusterPlan {
    pub graph: ResourceGraph,
    pub bucket_name: String,
    pub network: NetworkRef,
    pub bastion: Option<ProvisionedInstance>,
    pub bastion_gate: Option<ResourceId>,
    pub clusters: Vec<ClusterNodes>,
    pub mesh_firewall: ResourceId,
}

/// Custom role ids only allow letters, digits, `_` and `.`.
pub fn custom_role_id(lab_name: &str, suffix: &str) -> String {
    let lab: String = lab_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}{}", lab, suffix)
}

async fn read_config_file(path: &Path) -> LabResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e)).into())
}

async fn remote_config_files(dir: &Path) -> LabResult<Vec<(String, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| std::io::Error::new(e.kind(), format!("{}: {}", dir.display(), e)))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

fn lab_metadata(bucket_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("enable-guest-attributes".to_string(), "TRUE".to_string()),
        ("config-bucket".to_string(), bucket_name.to_string()),
    ])
}

/// Custom role bound to `identity` on the project and on the config bucket.
#[allow(clippy::too_many_arguments)]
fn grant_lab_access(
    graph: &mut ResourceGraph,
    ctx: &LabContext,
    tier: &str,
    role_suffix: &str,
    title: String,
    identity: &IdentityRef,
    bucket: (&ResourceId, &str),
    after: &[ResourceId],
) -> LabResult<Vec<ResourceId>> {
    let lab = &ctx.lab_name;
    let spec = CustomRoleSpec {
        role_id: custom_role_id(lab, role_suffix),
        title,
        permissions: LAB_NODE_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
    };
    let role_name = spec.role_name(&ctx.project);
    let role = graph.add(format!("{}-{}-role", lab, tier), Resource::CustomRole(spec), after.iter().cloned())?;

    let project_binding = graph.add(
        format!("{}-{}-binding", lab, tier),
        Resource::Binding(IamBinding {
            scope: BindingScope::Project,
            role: role_name.clone(),
            members: vec![identity.identity.member()],
        }),
        [role.clone(), identity.id.clone()],
    )?;
    let bucket_binding = graph.add(
        format!("{}-{}-bucket-binding", lab, tier),
        Resource::Binding(IamBinding {
            scope: BindingScope::Bucket(bucket.1.to_string()),
            role: role_name,
            members: vec![identity.identity.member()],
        }),
        [role, identity.id.clone(), bucket.0.clone()],
    )?;
    Ok(vec![project_binding, bucket_binding])
}

impl ClusterPlan {
    pub async fn assemble(ctx: &LabContext, opts: &ClusterLabOptions, keys: &SshKeyPair) -> LabResult<Self> {
        let lab = ctx.lab_name.as_str();
        let mut graph = ResourceGraph::new();

        let suffix = opts
            .bucket_suffix
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..100_000));
        let bucket_name = format!("{}-k8s-config-bucket-{}", lab, suffix);
        let bucket = graph.add_root(
            format!("{}-config-bucket", lab),
            Resource::Bucket(BucketSpec {
                name: bucket_name.clone(),
                location: ctx.region.clone(),
                force_destroy: true,
            }),
        )?;

        let mut uploads = Vec::new();
        for (name, source) in remote_config_files(&opts.config_dir.join(REMOTE_CONFIG_DIR)).await? {
            debug!(file = %name, "uploading remote config");
            uploads.push(graph.add(
                format!("{}-remote-configs-{}", lab, name),
                Resource::BucketObject(BucketObjectSpec {
                    bucket: bucket_name.clone(),
                    name,
                    source,
                }),
                [bucket.clone()],
            )?);
        }
        uploads.push(graph.add(
            format!("{}-remote-configs-priv-ssh", lab),
            Resource::BucketObject(BucketObjectSpec {
                bucket: bucket_name.clone(),
                name: PRIVATE_KEY_FILE.to_string(),
                source: keys.private_path.clone(),
            }),
            [bucket.clone()],
        )?);

        let assembler = NetworkAssembler::new(lab, &ctx.region, ctx.existing_network.as_deref());
        let network = assembler.network(&mut graph, "k8s-vpc")?;
        let access_subnet: Option<SubnetRef> = if opts.bastion {
            Some(assembler.subnet(&mut graph, &network, "access-subnet", "192.168.99.0/24", false)?)
        } else {
            None
        };
        let node_subnets = vec![
            assembler.subnet(&mut graph, &network, "k8s-subnet-1", "192.168.1.0/24", true)?,
            assembler.subnet(&mut graph, &network, "k8s-subnet-2", "192.168.2.0/24", true)?,
        ];

        let mut bastion = None;
        let mut bastion_gate = None;
        let mut bastion_identity = None;

        if let Some(access_subnet) = access_subnet {
            let router = assembler.nat_router(&mut graph, &network, "k8s")?;
            let identity = IdentityRef::declare(
                &mut graph,
                &ctx.project,
                format!("{}-bastion-sa", lab),
                format!("SA for {}-bastion", lab),
                std::iter::empty(),
            )?;
            let grants = grant_lab_access(
                &mut graph,
                ctx,
                "bastion",
                "BastionRole",
                format!("Role for K8S bastion - lab {}", lab),
                &identity,
                (&bucket, &bucket_name),
                &[],
            )?;

            let template = read_config_file(&opts.config_dir.join(BASTION_SCRIPT)).await?;
            let fleet = VmFleetOptions {
                vm_num: 1,
                role_id: "bastion".to_string(),
                vm_type: opts.bastion_vm_type.clone(),
                image: opts.image.clone(),
                os_username: opts.os_username.clone(),
                public: true,
                user_data: render(&template, &opts.bastion_params(lab))?,
                publicly_opened_fw_ports: opts.bastion_ports(),
                extra_metadata: lab_metadata(&bucket_name),
            };
            let handles = VmFleet::new(ctx, &fleet)
                .with_identity(identity.clone())
                .with_network(network.clone(), vec![access_subnet])
                .after(uploads.iter().cloned().chain(grants).chain([router]))
                .assemble(&mut graph)?;

            let access = handles
                .instances
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::MissingOutput {
                    resource: format!("{}-bastion-0", lab),
                })?;
            bastion_gate = Some(access.gate(&mut graph, &ctx.project, ctx.poll)?);
            bastion = Some(access);
            bastion_identity = Some(identity);
        }

        let gate: Vec<ResourceId> = bastion_gate.iter().cloned().collect();

        let k8s_identity = IdentityRef::declare(
            &mut graph,
            &ctx.project,
            format!("{}-k8s-sa", lab),
            format!("SA for {} k8s nodes", lab),
            gate.iter().cloned(),
        )?;
        let grants = grant_lab_access(
            &mut graph,
            ctx,
            "k8s",
            "K8sRole",
            format!("Role for K8S Nodes - lab {}", lab),
            &k8s_identity,
            (&bucket, &bucket_name),
            &gate,
        )?;
        let node_deps: Vec<ResourceId> = gate.iter().chain(&uploads).chain(&grants).cloned().collect();

        let node_template = read_config_file(&opts.config_dir.join(NODE_SCRIPT)).await?;
        let control_planes = VmFleetOptions {
            vm_num: opts.clusters_num,
            role_id: "k8s-cp".to_string(),
            vm_type: opts.vm_type.clone(),
            image: opts.image.clone(),
            os_username: opts.os_username.clone(),
            public: !opts.bastion,
            user_data: render(&node_template, &opts.node_params("cp", None))?,
            publicly_opened_fw_ports: opts.node_ports(&["22", "6443"]),
            extra_metadata: lab_metadata(&bucket_name),
        };
        let control_planes = VmFleet::new(ctx, &control_planes)
            .with_identity(k8s_identity.clone())
            .with_network(network.clone(), node_subnets.clone())
            .after(node_deps.iter().cloned())
            .assemble(&mut graph)?;

        let mut clusters = Vec::with_capacity(control_planes.instances.len());
        for (i, control_plane) in control_planes.instances.into_iter().enumerate() {
            let control_plane_gate = control_plane.gate(&mut graph, &ctx.project, ctx.poll)?;

            let mut metadata = lab_metadata(&bucket_name);
            metadata.insert("cp".to_string(), control_plane.name.clone());
            let worker_options = VmFleetOptions {
                vm_num: opts.workers_num,
                role_id: format!("k8s-{}-wk", i),
                vm_type: opts.vm_type.clone(),
                image: opts.image.clone(),
                os_username: opts.os_username.clone(),
                public: !opts.bastion,
                user_data: render(&node_template, &opts.node_params("wk", Some(&control_plane.name)))?,
                publicly_opened_fw_ports: opts.node_ports(&["22"]),
                extra_metadata: metadata,
            };
            let workers = VmFleet::new(ctx, &worker_options)
                .with_identity(k8s_identity.clone())
                .with_network(network.clone(), node_subnets.clone())
                .after(node_deps.iter().cloned().chain([control_plane_gate.clone()]))
                .assemble(&mut graph)?;
            for worker in &workers.instances {
                worker.gate(&mut graph, &ctx.project, ctx.poll)?;
            }

            clusters.push(ClusterNodes {
                control_plane,
                control_plane_gate,
                workers: workers.instances,
            });
        }

        let mut identities = vec![k8s_identity.email().to_string()];
        let mut mesh_deps = vec![network.id.clone(), k8s_identity.id.clone()];
        if let Some(identity) = &bastion_identity {
            identities.push(identity.email().to_string());
            mesh_deps.push(identity.id.clone());
        }
        let rule = mesh_rule(
            format!("{}-k8s-fw-rule", lab),
            &network.name,
            "All traffic is allowed among k8s nodes (and bastion)",
            &identities,
        );
        let mesh_firewall = graph.add(rule.name.clone(), Resource::Firewall(rule), mesh_deps.into_iter().chain(gate))?;

        info!(
            "Planned cluster lab {}: bastion={}, {} cluster(s) x {} worker(s), {} readiness gates",
            lab,
            bastion.is_some(),
            clusters.len(),
            opts.workers_num,
            graph.count_kind("readiness")
        );

        Ok(Self {
            graph,
            bucket_name,
            network,
            bastion,
            bastion_gate,
            clusters,
            mesh_firewall,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bastion_opens_one_port_per_access_node_plus_console() {
        let opts = ClusterLabOptions {
            bastion: true,
            access_num: 2,
            clusters_num: 3,
            workers_num: 1,
            cluster_ready: false,
            k8s_version: "1.35".into(),
            etcd_version: "3.6.6".into(),
            cilium_version: "1.18.3".into(),
            access_psw: "lab123".into(),
            os_username: "ubuntu".into(),
            vm_type: "e2-medium".into(),
            bastion_vm_type: "e2-standard-8".into(),
            image: "ubuntu-2204-lts".into(),
            config_dir: PathBuf::from("config"),
            bucket_suffix: Some(1),
        };
        assert_eq!(opts.bastion_ports(), vec!["22", "8080", "8081", "8082"]);
        assert_eq!(opts.node_ports(&["22", "6443"]), vec!["22", "6443"]);

        let open = ClusterLabOptions { bastion: false, ..opts };
        assert_eq!(open.node_ports(&["22"]), vec!["80", "443", "22"]);
    }

    #[test]
    fn test_role_ids_are_sanitized() {
        assert_eq!(custom_role_id("my-lab", "K8sRole"), "my_labK8sRole");
    }

    #[test]
    fn test_worker_params_carry_control_plane_name() {
        let opts = ClusterLabOptions {
            bastion: false,
            access_num: 0,
            clusters_num: 1,
            workers_num: 1,
            cluster_ready: true,
            k8s_version: "1.35".into(),
            etcd_version: "3.6.6".into(),
            cilium_version: "1.18.3".into(),
            access_psw: String::new(),
            os_username: "ubuntu".into(),
            vm_type: "e2-medium".into(),
            bastion_vm_type: "e2-standard-8".into(),
            image: "ubuntu-2204-lts".into(),
            config_dir: PathBuf::from("config"),
            bucket_suffix: None,
        };
        let params = opts.node_params("wk", Some("lab-k8s-cp-0"));
        assert_eq!(params["CP_NAME"], "lab-k8s-cp-0");
        assert_eq!(params["K8S_ROLE"], "wk");
        assert_eq!(params["CLUSTER_READY"], "true");
        assert!(!opts.node_params("cp", None).contains_key("CP_NAME"));
    }
}
