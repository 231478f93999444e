//! In-RAM store with resource versions and generations, applying the same
//! merge patches the API server would receive.

use std::collections::BTreeMap;
use std::sync::Mutex;

use kiln_core::{Build, BuildStatus, Kit, KitStatus, ObjectKey, Platform};
use kube::ResourceExt;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::patch::{apply_merge_patch, merge_patch};
use crate::{ClusterStore, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    kits: BTreeMap<ObjectKey, Kit>,
    builds: BTreeMap<ObjectKey, Build>,
    platforms: BTreeMap<ObjectKey, Platform>,
    secrets: BTreeMap<ObjectKey, BTreeMap<String, Vec<u8>>>,
    rv: u64,
    kit_status_writes: u64,
    forced_conflicts: u32,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn lock(m: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn check_rv(stored: Option<&str>, base: Option<&str>, what: &ObjectKey) -> StoreResult<()> {
    match base {
        Some(rv) if Some(rv) != stored => Err(StoreError::Conflict(format!(
            "{}: resource version {} is stale (stored {})",
            what,
            rv,
            stored.unwrap_or("-")
        ))),
        _ => Ok(()),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update a kit the way a user would: spec changes bump the
    /// generation, status is preserved from the stored copy.
    pub fn put_kit(&self, mut kit: Kit) -> Kit {
        let mut inner = lock(&self.inner);
        let key = ObjectKey::of(&kit);
        match inner.kits.get(&key).cloned() {
            Some(prev) => {
                let spec_changed = prev.spec != kit.spec;
                kit.metadata.uid = prev.metadata.uid.clone();
                kit.metadata.generation = prev.generation().map(|g| if spec_changed { g + 1 } else { g });
                kit.status = prev.status.clone();
            }
            None => {
                kit.metadata.uid = Some(Uuid::new_v4().to_string());
                kit.metadata.generation = Some(1);
            }
        }
        kit.metadata.resource_version = Some(inner.next_rv());
        inner.kits.insert(key, kit.clone());
        kit
    }

    /// Overwrite a kit's status out of band, as another writer would.
    pub fn set_kit_status(&self, key: &ObjectKey, status: KitStatus) -> Option<Kit> {
        let mut inner = lock(&self.inner);
        let rv = inner.next_rv();
        let kit = inner.kits.get_mut(key)?;
        kit.status = Some(status);
        kit.metadata.resource_version = Some(rv);
        Some(kit.clone())
    }

    pub fn delete_kit(&self, key: &ObjectKey) -> Option<Kit> {
        let mut inner = lock(&self.inner);
        let kit = inner.kits.remove(key)?;
        // owned builds go with their kit
        let uid = kit.metadata.uid.clone();
        inner.builds.retain(|_, b| !b.owner_references().iter().any(|o| Some(&o.uid) == uid.as_ref()));
        Some(kit)
    }

    pub fn put_platform(&self, mut platform: Platform) -> Platform {
        let mut inner = lock(&self.inner);
        platform.metadata.resource_version = Some(inner.next_rv());
        inner.platforms.insert(ObjectKey::of(&platform), platform.clone());
        platform
    }

    pub fn put_build(&self, mut build: Build) -> Build {
        let mut inner = lock(&self.inner);
        if build.metadata.uid.is_none() {
            build.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        build.metadata.resource_version = Some(inner.next_rv());
        inner.builds.insert(ObjectKey::of(&build), build.clone());
        build
    }

    pub fn put_secret(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        lock(&self.inner).secrets.insert(ObjectKey::new(namespace, name), data);
    }

    pub fn kit(&self, key: &ObjectKey) -> Option<Kit> {
        lock(&self.inner).kits.get(key).cloned()
    }

    pub fn build(&self, key: &ObjectKey) -> Option<Build> {
        lock(&self.inner).builds.get(key).cloned()
    }

    /// Make the next kit status write fail with a conflict, as if another
    /// writer got there first.
    pub fn conflict_next_status_write(&self) {
        lock(&self.inner).forced_conflicts += 1;
    }

    /// Number of successful kit status writes so far.
    pub fn kit_status_writes(&self) -> u64 {
        lock(&self.inner).kit_status_writes
    }
}

#[async_trait::async_trait]
impl ClusterStore for MemoryStore {
    async fn get_kit(&self, key: &ObjectKey) -> StoreResult<Option<Kit>> {
        Ok(self.kit(key))
    }

    async fn list_kits(&self, namespace: &str) -> StoreResult<Vec<Kit>> {
        let inner = lock(&self.inner);
        Ok(inner.kits.iter().filter(|(k, _)| k.namespace == namespace).map(|(_, v)| v.clone()).collect())
    }

    async fn patch_kit_status(&self, base: &Kit, target: &Kit) -> StoreResult<Kit> {
        let base_status = serde_json::to_value(base.status.clone().unwrap_or_default())?;
        let target_status = serde_json::to_value(target.status.clone().unwrap_or_default())?;
        let patch = merge_patch(&base_status, &target_status);

        let mut inner = lock(&self.inner);
        let key = ObjectKey::of(base);
        if inner.forced_conflicts > 0 {
            inner.forced_conflicts -= 1;
            return Err(StoreError::Conflict(format!("kit {}: concurrent update", key)));
        }
        let stored = inner.kits.get(&key).ok_or_else(|| StoreError::NotFound(format!("kit {}", key)))?;
        check_rv(stored.metadata.resource_version.as_deref(), base.metadata.resource_version.as_deref(), &key)?;

        let mut status: Json = serde_json::to_value(stored.status.clone().unwrap_or_default())?;
        apply_merge_patch(&mut status, &patch);
        let status: KitStatus = serde_json::from_value(status)?;

        let rv = inner.next_rv();
        inner.kit_status_writes += 1;
        let stored = inner.kits.get_mut(&key).ok_or_else(|| StoreError::NotFound(format!("kit {}", key)))?;
        stored.status = Some(status);
        stored.metadata.resource_version = Some(rv);
        Ok(stored.clone())
    }

    async fn get_platform(&self, namespace: &str, name: &str) -> StoreResult<Option<Platform>> {
        Ok(lock(&self.inner).platforms.get(&ObjectKey::new(namespace, name)).cloned())
    }

    async fn list_platforms(&self, namespace: &str) -> StoreResult<Vec<Platform>> {
        let inner = lock(&self.inner);
        Ok(inner.platforms.iter().filter(|(k, _)| k.namespace == namespace).map(|(_, v)| v.clone()).collect())
    }

    async fn get_build(&self, namespace: &str, name: &str) -> StoreResult<Option<Build>> {
        Ok(self.build(&ObjectKey::new(namespace, name)))
    }

    async fn create_build(&self, build: &Build) -> StoreResult<Build> {
        let key = ObjectKey::of(build);
        if lock(&self.inner).builds.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("build {}", key)));
        }
        Ok(self.put_build(build.clone()))
    }

    async fn delete_build(&self, namespace: &str, name: &str) -> StoreResult<()> {
        lock(&self.inner).builds.remove(&ObjectKey::new(namespace, name));
        Ok(())
    }

    async fn patch_build_status(&self, base: &Build, status: &BuildStatus) -> StoreResult<Build> {
        let mut inner = lock(&self.inner);
        let key = ObjectKey::of(base);
        let stored = inner.builds.get(&key).ok_or_else(|| StoreError::NotFound(format!("build {}", key)))?;
        check_rv(stored.metadata.resource_version.as_deref(), base.metadata.resource_version.as_deref(), &key)?;
        let rv = inner.next_rv();
        let stored = inner.builds.get_mut(&key).ok_or_else(|| StoreError::NotFound(format!("build {}", key)))?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(rv);
        Ok(stored.clone())
    }

    async fn get_secret_data(&self, namespace: &str, name: &str) -> StoreResult<BTreeMap<String, Vec<u8>>> {
        lock(&self.inner)
            .secrets
            .get(&ObjectKey::new(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("secret {}/{}", namespace, name)))
    }
}
