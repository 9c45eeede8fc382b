#![allow(dead_code)]

use gce_lab_manager::core::readiness::PollSettings;
use gce_lab_manager::topology::{ClusterLabOptions, LabContext, VmFleetOptions};
use gce_lab_manager::utils::keys::SshKeyPair;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

pub const PROJECT: &str = "lab-project";

pub fn context(lab_name: &str) -> LabContext {
    LabContext {
        project: PROJECT.to_string(),
        region: "us-central1".to_string(),
        lab_name: lab_name.to_string(),
        public_key: "ssh-ed25519 AAAAC3Nza ubuntu@gcp".to_string(),
        existing_network: None,
        poll: PollSettings {
            interval: Duration::from_secs(10),
            deadline: None,
        },
    }
}

pub fn fleet_options(vm_num: u32) -> VmFleetOptions {
    VmFleetOptions {
        vm_num,
        role_id: "vm".to_string(),
        vm_type: "e2-medium".to_string(),
        image: "ubuntu-2204-lts".to_string(),
        os_username: "ubuntu".to_string(),
        public: true,
        user_data: String::new(),
        publicly_opened_fw_ports: vec!["80".into(), "443".into(), "22".into()],
        extra_metadata: BTreeMap::new(),
    }
}

/// Config directory with both startup templates and two remote config files.
pub fn config_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let user_data = dir.path().join("K8S/userData");
    let remote = dir.path().join("K8S/remote");
    std::fs::create_dir_all(&user_data).unwrap();
    std::fs::create_dir_all(&remote).unwrap();
    std::fs::write(
        user_data.join("bastion.sh"),
        "#!/bin/bash\nLAB={{LAB_NAME}} ACCESS={{ACCESS_NUM}} CLUSTERS={{CLUSTERS_NUM}}\n",
    )
    .unwrap();
    std::fs::write(
        user_data.join("k8s.sh"),
        "#!/bin/bash\nROLE={{K8S_ROLE}} CP={{CP_NAME}} K8S={{K8S_VERSION}}\n",
    )
    .unwrap();
    std::fs::write(remote.join("kubeadm-config.yaml"), "kind: ClusterConfiguration\n").unwrap();
    std::fs::write(remote.join("cilium-values.yaml"), "ipam: {}\n").unwrap();
    dir
}

pub fn key_pair(dir: &Path) -> SshKeyPair {
    let (private_path, public_path) = SshKeyPair::paths(dir);
    std::fs::write(&private_path, "PRIVATE KEY\n").unwrap();
    std::fs::write(&public_path, "ssh-ed25519 AAAAC3Nza ubuntu@gcp\n").unwrap();
    SshKeyPair {
        private_key: "PRIVATE KEY\n".to_string(),
        public_key: "ssh-ed25519 AAAAC3Nza ubuntu@gcp".to_string(),
        private_path,
        public_path,
    }
}

pub fn cluster_options(config_dir: &Path, bastion: bool) -> ClusterLabOptions {
    ClusterLabOptions {
        bastion,
        access_num: 2,
        clusters_num: 3,
        workers_num: 1,
        cluster_ready: false,
        k8s_version: "1.35".to_string(),
        etcd_version: "3.6.6".to_string(),
        cilium_version: "1.18.3".to_string(),
        access_psw: "lab123".to_string(),
        os_username: "ubuntu".to_string(),
        vm_type: "e2-medium".to_string(),
        bastion_vm_type: "e2-standard-8".to_string(),
        image: "ubuntu-2204-lts".to_string(),
        config_dir: config_dir.to_path_buf(),
        bucket_suffix: Some(4242),
    }
}
