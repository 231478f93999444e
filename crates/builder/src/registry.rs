//! Per-invocation staging of registry credentials.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use kiln_store::ClusterStore;
use tracing::{debug, warn};
use uuid::Uuid;

/// Secret entry holding a docker config; staged as `config.json`.
const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
const DOCKER_CONFIG_FILE: &str = "config.json";

/// A secret written to a private leaf directory under a shared root. The
/// leaf carries a random suffix so concurrent builds on one node never
/// collide. Dropping without [`RegistryMount::release`] still removes the
/// directory, best effort.
#[derive(Debug)]
pub struct RegistryMount {
    path: PathBuf,
    released: bool,
}

impl RegistryMount {
    pub async fn mount(
        store: &dyn ClusterStore,
        namespace: &str,
        root: &Path,
        prefix: &str,
        secret: &str,
    ) -> Result<Self> {
        let data = store
            .get_secret_data(namespace, secret)
            .await
            .with_context(|| format!("reading registry secret {}/{}", namespace, secret))?;

        let path = root.join(format!("{}{}", prefix, Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("creating credential dir {}", path.display()))?;
        let mount = Self { path, released: false };
        restrict_permissions(&mount.path).await?;

        for (key, value) in data {
            let file = if key == DOCKER_CONFIG_KEY { DOCKER_CONFIG_FILE.to_string() } else { key };
            if file.is_empty() || file.contains('/') || file == "." || file == ".." {
                bail!("secret {} has an unusable entry name {:?}", secret, file);
            }
            let target = mount.path.join(&file);
            tokio::fs::write(&target, value)
                .await
                .with_context(|| format!("writing credential file {}", target.display()))?;
        }
        debug!(path = %mount.path.display(), secret, "registry credentials mounted");
        Ok(mount)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the staged credentials. A directory that is already gone
    /// counts as released.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing credential dir {}", self.path.display())),
        }
    }
}

impl Drop for RegistryMount {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove credential dir on drop");
            }
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .await
        .with_context(|| format!("restricting permissions on {}", path.display()))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_store::MemoryStore;
    use std::collections::BTreeMap;

    fn store_with_secret() -> MemoryStore {
        let store = MemoryStore::new();
        let mut data = BTreeMap::new();
        data.insert(DOCKER_CONFIG_KEY.to_string(), br#"{"auths":{}}"#.to_vec());
        data.insert("ca.crt".to_string(), b"pem".to_vec());
        store.put_secret("ns", "reg-creds", data);
        store
    }

    #[tokio::test]
    async fn mount_stages_files_and_release_removes_them() {
        let root = tempfile::tempdir().unwrap();
        let store = store_with_secret();
        let m = RegistryMount::mount(&store, "ns", root.path(), "jib-secret-", "reg-creds").await.unwrap();
        let path = m.path().to_path_buf();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("jib-secret-"));
        assert_eq!(std::fs::read(path.join("config.json")).unwrap(), br#"{"auths":{}}"#.to_vec());
        assert!(path.join("ca.crt").exists());
        m.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn concurrent_mounts_get_distinct_leaves() {
        let root = tempfile::tempdir().unwrap();
        let store = store_with_secret();
        let a = RegistryMount::mount(&store, "ns", root.path(), "jib-secret-", "reg-creds").await.unwrap();
        let b = RegistryMount::mount(&store, "ns", root.path(), "jib-secret-", "reg-creds").await.unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[tokio::test]
    async fn drop_without_release_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let store = store_with_secret();
        let m = RegistryMount::mount(&store, "ns", root.path(), "jib-secret-", "reg-creds").await.unwrap();
        let path = m.path().to_path_buf();
        drop(m);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_secret_fails_without_leaving_a_dir() {
        let root = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let err = RegistryMount::mount(&store, "ns", root.path(), "jib-secret-", "nope").await.unwrap_err();
        assert!(err.to_string().contains("ns/nope"));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
