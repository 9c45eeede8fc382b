use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::{LabError, LabResult};

pub const PRIVATE_KEY_FILE: &str = "key.pem";
pub const PUBLIC_KEY_FILE: &str = "key.pub";
pub const KEY_COMMENT: &str = "ubuntu@gcp";

/// SSH key pair injected into every instance and uploaded to the config bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPair {
    pub private_key: String,
    pub public_key: String,
    pub private_path: PathBuf,
    pub public_path: PathBuf,
}

impl SshKeyPair {
    pub fn paths(dir: &Path) -> (PathBuf, PathBuf) {
        (dir.join(PRIVATE_KEY_FILE), dir.join(PUBLIC_KEY_FILE))
    }

    async fn read(dir: &Path) -> LabResult<Self> {
        let (private_path, public_path) = Self::paths(dir);
        Ok(Self {
            private_key: tokio::fs::read_to_string(&private_path).await?,
            public_key: tokio::fs::read_to_string(&public_path).await?.trim_end().to_string(),
            private_path,
            public_path,
        })
    }
}

/// Reuse `key.pem`/`key.pub` from `dir` when both exist, otherwise generate a
/// fresh ed25519 pair with `ssh-keygen` and persist it there.
pub async fn load_or_generate(dir: &Path) -> LabResult<SshKeyPair> {
    let (private_path, public_path) = SshKeyPair::paths(dir);
    if private_path.exists() && public_path.exists() {
        info!("Using existing key pair from {}", dir.display());
        return SshKeyPair::read(dir).await;
    }

    tokio::fs::create_dir_all(dir).await?;
    let generated_pub = private_path.with_extension("pem.pub");
    for stale in [&private_path, &public_path, &generated_pub] {
        if stale.exists() {
            warn!("Removing incomplete key material {}", stale.display());
            tokio::fs::remove_file(stale).await?;
        }
    }

    info!("Generating new ed25519 key pair in {}", dir.display());
    let output = Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", KEY_COMMENT, "-f"])
        .arg(&private_path)
        .output()
        .await?;

    if !output.status.success() {
        return Err(LabError::SystemError(std::io::Error::other(format!(
            "ssh-keygen failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }

    tokio::fs::rename(&generated_pub, &public_path).await?;
    SshKeyPair::read(dir).await
}
