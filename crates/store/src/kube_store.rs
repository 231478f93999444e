//! API-server backed store.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kiln_core::{Build, BuildStatus, Kit, ObjectKey, Platform};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use metrics::counter;
use tracing::debug;

use crate::patch::status_patch;
use crate::{ClusterStore, StoreError, StoreResult};

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn kits(&self, ns: &str) -> Api<Kit> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn builds(&self, ns: &str) -> Api<Build> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn platforms(&self, ns: &str) -> Api<Platform> {
        Api::namespaced(self.client.clone(), ns)
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> StoreResult<String> {
    obj.namespace().ok_or_else(|| StoreError::Invalid(format!("{} has no namespace", obj.name_any())))
}

#[async_trait::async_trait]
impl ClusterStore for KubeStore {
    async fn get_kit(&self, key: &ObjectKey) -> StoreResult<Option<Kit>> {
        Ok(self.kits(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list_kits(&self, namespace: &str) -> StoreResult<Vec<Kit>> {
        Ok(self.kits(namespace).list(&ListParams::default()).await?.items)
    }

    async fn patch_kit_status(&self, base: &Kit, target: &Kit) -> StoreResult<Kit> {
        let ns = namespace_of(base)?;
        let base_status = serde_json::to_value(base.status.clone().unwrap_or_default())?;
        let target_status = serde_json::to_value(target.status.clone().unwrap_or_default())?;
        let patch = status_patch(base.metadata.resource_version.as_deref(), &base_status, &target_status);
        debug!(kit = %ObjectKey::of(base), patch = %patch, "patching kit status");
        let res = self
            .kits(&ns)
            .patch_status(&base.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(StoreError::from);
        if matches!(&res, Err(e) if e.is_conflict()) {
            counter!("status_conflicts_total", 1u64);
        }
        res
    }

    async fn get_platform(&self, namespace: &str, name: &str) -> StoreResult<Option<Platform>> {
        Ok(self.platforms(namespace).get_opt(name).await?)
    }

    async fn list_platforms(&self, namespace: &str) -> StoreResult<Vec<Platform>> {
        Ok(self.platforms(namespace).list(&ListParams::default()).await?.items)
    }

    async fn get_build(&self, namespace: &str, name: &str) -> StoreResult<Option<Build>> {
        Ok(self.builds(namespace).get_opt(name).await?)
    }

    async fn create_build(&self, build: &Build) -> StoreResult<Build> {
        let ns = namespace_of(build)?;
        Ok(self.builds(&ns).create(&PostParams::default(), build).await?)
    }

    async fn delete_build(&self, namespace: &str, name: &str) -> StoreResult<()> {
        match self.builds(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match StoreError::from(e) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn patch_build_status(&self, base: &Build, status: &BuildStatus) -> StoreResult<Build> {
        let ns = namespace_of(base)?;
        let base_status = serde_json::to_value(base.status.clone().unwrap_or_default())?;
        let target_status = serde_json::to_value(status)?;
        let patch = status_patch(base.metadata.resource_version.as_deref(), &base_status, &target_status);
        Ok(self
            .builds(&ns)
            .patch_status(&base.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_secret_data(&self, namespace: &str, name: &str) -> StoreResult<BTreeMap<String, Vec<u8>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("secret {}/{}", namespace, name)))?;
        let mut out: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (k, v) in secret.data.unwrap_or_default() {
            out.insert(k, v.0);
        }
        for (k, v) in secret.string_data.unwrap_or_default() {
            out.insert(k, v.into_bytes());
        }
        Ok(out)
    }
}
