/*
* Lab Configuration
* -----------------
* Every option the assemblers need is resolved once at startup into a
* `LabRequest` and passed down explicitly; nothing reads the environment later.
*
* Configuration Hierarchy (from lowest to highest priority):
* -----------------------------------------------------
* 1. Hardcoded defaults
* 2. lab.toml (or the file given with --config)
* 3. Environment variables prefixed with LAB_ (LAB_TYPE, LAB_NAME, LAB_VM_NUM, ...)
*
* List options (LAB_PUBLICLY_OPENED_FW_PORTS) are comma separated, extra
* metadata is either a TOML table or `key=value,key2=value2`.
*/

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::core::readiness::PollSettings;
use crate::errors::SettingsError;
use crate::topology::cluster_lab::{ClusterLabOptions, FIRST_ACCESS_PORT};
use crate::topology::vm_fleet::VmFleetOptions;

const ENV_PREFIX: &str = "LAB";
const DEFAULT_FILE: &str = "lab.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabType {
    Vm,
    K8s,
    BigData,
}

impl FromStr for LabType {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VM" => Ok(LabType::Vm),
            "K8S" => Ok(LabType::K8s),
            "BIGDATA" => Ok(LabType::BigData),
            other => Err(SettingsError::UnknownLabType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataInput {
    Table(BTreeMap<String, String>),
    Text(String),
}

impl MetadataInput {
    pub fn into_map(self) -> Result<BTreeMap<String, String>, SettingsError> {
        match self {
            MetadataInput::Table(map) => Ok(map),
            MetadataInput::Text(text) => text
                .split(',')
                .map(str::trim)
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    pair.split_once('=')
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                        .ok_or_else(|| SettingsError::Invalid {
                            key: "extra_metadata",
                            reason: format!("`{}` is not key=value", pair),
                        })
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabSettings {
    pub lab_type: Option<String>,
    pub lab_name: Option<String>,
    pub project: Option<String>,
    pub credentials: Option<String>,
    pub region: String,

    pub vm_num: Option<u32>,
    pub vm_type: String,
    pub image: String,
    pub os_username: String,
    pub user_data: Option<String>,
    pub publicly_opened_fw_ports: Option<Vec<String>>,
    pub extra_metadata: Option<MetadataInput>,

    pub bastion: bool,
    pub bastion_vm_type: String,
    pub access_num: Option<u32>,
    pub clusters_num: Option<u32>,
    pub workers_num: u32,
    pub cluster_ready: bool,
    pub k8s_version: String,
    pub etcd_version: String,
    pub cilium_version: String,
    pub access_psw: String,

    pub poll_interval_secs: u64,
    pub readiness_timeout_secs: Option<u64>,
    pub existing_network: Option<String>,
    pub config_dir: PathBuf,
    pub key_dir: PathBuf,
    pub bucket_suffix: Option<u32>,
}

/// Where settings come from. The file locations and the environment are
/// captured up front so loading reads nothing it was not handed.
#[derive(Debug, Clone, Default)]
pub struct SettingsSources {
    /// Must exist.
    pub file: Option<PathBuf>,
    /// Read when present, used only without `file`.
    pub optional_default: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl SettingsSources {
    pub fn from_process(file: Option<PathBuf>) -> Self {
        Self {
            optional_default: file.is_none().then(|| PathBuf::from(DEFAULT_FILE)),
            file,
            env: std::env::vars().collect(),
        }
    }
}

/// `LAB_TYPE` and `LAB_NAME` read naturally but map to `lab_type`/`lab_name`.
fn environment_source(env: &HashMap<String, String>) -> Environment {
    let vars: config::Map<String, String> = env
        .iter()
        .filter(|(key, _)| key.starts_with("LAB_"))
        .map(|(key, value)| {
            let key = match key.as_str() {
                "LAB_TYPE" => "LAB_LAB_TYPE".to_string(),
                "LAB_NAME" => "LAB_LAB_NAME".to_string(),
                _ => key.clone(),
            };
            (key, value.clone())
        })
        .collect();

    Environment::with_prefix(ENV_PREFIX)
        .source(Some(vars))
        .list_separator(",")
        .with_list_parse_key("publicly_opened_fw_ports")
}

impl LabSettings {
    pub fn new() -> Result<Self, SettingsError> {
        Self::load(&SettingsSources::from_process(None))
    }

    /// Defaults < settings file < `LAB_*` environment.
    pub fn load(sources: &SettingsSources) -> Result<Self, SettingsError> {
        let file = match (&sources.file, &sources.optional_default) {
            (Some(path), _) => {
                info!("Loading lab settings from {}", path.display());
                Some(File::from(path.as_path()).required(true))
            }
            (None, Some(path)) => Some(File::from(path.as_path()).required(false)),
            (None, None) => None,
        };

        let mut builder = Config::builder()
            .set_default("region", "us-central1")?
            .set_default("vm_type", "e2-medium")?
            .set_default("image", "ubuntu-2204-lts")?
            .set_default("os_username", "ubuntu")?
            .set_default("bastion", true)?
            .set_default("bastion_vm_type", "e2-standard-8")?
            .set_default("workers_num", 1)?
            .set_default("cluster_ready", false)?
            .set_default("k8s_version", "1.35")?
            .set_default("etcd_version", "3.6.6")?
            .set_default("cilium_version", "1.18.3")?
            .set_default("access_psw", "lab123")?
            .set_default("poll_interval_secs", 10)?
            .set_default("config_dir", "config")?
            .set_default("key_dir", ".")?;
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let config = builder.add_source(environment_source(&sources.env)).build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn lab_kind(&self) -> Result<LabType, SettingsError> {
        self.lab_type
            .as_deref()
            .ok_or(SettingsError::Missing { key: "lab_type" })?
            .parse()
    }

    /// Command-line polling flags take precedence over every other source.
    pub fn with_poll_overrides(mut self, interval_secs: Option<u64>, timeout_secs: Option<u64>) -> Self {
        if let Some(interval) = interval_secs {
            self.poll_interval_secs = interval;
        }
        if timeout_secs.is_some() {
            self.readiness_timeout_secs = timeout_secs;
        }
        self
    }

    pub fn poll_settings(&self) -> Result<PollSettings, SettingsError> {
        if self.poll_interval_secs == 0 {
            return Err(SettingsError::Invalid {
                key: "poll_interval_secs",
                reason: "must be at least one second".to_string(),
            });
        }
        Ok(PollSettings {
            interval: Duration::from_secs(self.poll_interval_secs),
            deadline: self.readiness_timeout_secs.map(Duration::from_secs),
        })
    }

    /// Validate everything before any resource is declared.
    pub fn resolve(&self) -> Result<LabRequest, SettingsError> {
        let kind = self.lab_kind()?;
        let lab_name = self
            .lab_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .ok_or(SettingsError::Missing { key: "lab_name" })?;
        let poll = self.poll_settings()?;
        let extra_metadata = match self.extra_metadata.clone() {
            Some(input) => input.into_map()?,
            None => BTreeMap::new(),
        };

        let options = match kind {
            LabType::Vm => LabOptions::Vm(VmFleetOptions {
                vm_num: self.vm_num.ok_or(SettingsError::Missing { key: "vm_num" })?,
                role_id: "vm".to_string(),
                vm_type: self.vm_type.clone(),
                image: self.image.clone(),
                os_username: self.os_username.clone(),
                public: true,
                user_data: self.user_data.clone().unwrap_or_default(),
                publicly_opened_fw_ports: self
                    .publicly_opened_fw_ports
                    .clone()
                    .unwrap_or_else(|| vec!["80".into(), "443".into(), "22".into()]),
                extra_metadata,
            }),
            LabType::K8s => {
                let access_num = self.access_num.ok_or(SettingsError::Missing { key: "access_num" })?;
                let fits = FIRST_ACCESS_PORT
                    .checked_add(access_num)
                    .is_some_and(|last| last <= u32::from(u16::MAX));
                if !fits {
                    return Err(SettingsError::Invalid {
                        key: "access_num",
                        reason: format!(
                            "{} access nodes need bastion ports beyond 65535 (first port {})",
                            access_num, FIRST_ACCESS_PORT
                        ),
                    });
                }
                LabOptions::K8s(ClusterLabOptions {
                    bastion: self.bastion,
                    access_num,
                    clusters_num: self.clusters_num.unwrap_or(access_num + 1),
                    workers_num: self.workers_num,
                    cluster_ready: self.cluster_ready,
                    k8s_version: self.k8s_version.clone(),
                    etcd_version: self.etcd_version.clone(),
                    cilium_version: self.cilium_version.clone(),
                    access_psw: self.access_psw.clone(),
                    os_username: self.os_username.clone(),
                    vm_type: self.vm_type.clone(),
                    bastion_vm_type: self.bastion_vm_type.clone(),
                    image: self.image.clone(),
                    config_dir: self.config_dir.clone(),
                    bucket_suffix: self.bucket_suffix,
                })
            }
            LabType::BigData => return Err(SettingsError::Unimplemented("BIGDATA".to_string())),
        };

        Ok(LabRequest {
            lab_name,
            region: self.region.clone(),
            project: self.project.clone(),
            credentials: self.credentials.clone(),
            existing_network: self.existing_network.clone(),
            key_dir: self.key_dir.clone(),
            poll,
            options,
        })
    }
}

#[derive(Debug, Clone)]
pub enum LabOptions {
    Vm(VmFleetOptions),
    K8s(ClusterLabOptions),
}

/// Fully validated configuration for one run.
#[derive(Debug, Clone)]
pub struct LabRequest {
    pub lab_name: String,
    pub region: String,
    pub project: Option<String>,
    pub credentials: Option<String>,
    pub existing_network: Option<String>,
    pub key_dir: PathBuf,
    pub poll: PollSettings,
    pub options: LabOptions,
}

pub fn generate_default_config() -> LabSettings {
    LabSettings {
        lab_type: Some("K8S".to_string()),
        lab_name: Some("lab".to_string()),
        project: Some("my-project".to_string()),
        credentials: None,
        region: "us-central1".to_string(),
        vm_num: Some(1),
        vm_type: "e2-medium".to_string(),
        image: "ubuntu-2204-lts".to_string(),
        os_username: "ubuntu".to_string(),
        user_data: None,
        publicly_opened_fw_ports: Some(vec!["80".into(), "443".into(), "22".into()]),
        extra_metadata: None,
        bastion: true,
        bastion_vm_type: "e2-standard-8".to_string(),
        access_num: Some(2),
        clusters_num: None,
        workers_num: 1,
        cluster_ready: false,
        k8s_version: "1.35".to_string(),
        etcd_version: "3.6.6".to_string(),
        cilium_version: "1.18.3".to_string(),
        access_psw: "lab123".to_string(),
        poll_interval_secs: 10,
        readiness_timeout_secs: None,
        existing_network: None,
        config_dir: PathBuf::from("config"),
        key_dir: PathBuf::from("."),
        bucket_suffix: None,
    }
}
