//! Operator ownership rules and platform binding.

use kiln_core::{Kit, Platform};
use kiln_store::{ClusterStore, StoreError};
use kube::ResourceExt;
use thiserror::Error;

/// Which kits this operator instance is allowed to touch.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub operator_id: String,
    /// Namespaces to reconcile; empty means all.
    pub watch_namespaces: Vec<String>,
    /// Claim kits that carry no operator-id annotation.
    pub default_operator: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self { operator_id: "kiln".into(), watch_namespaces: Vec::new(), default_operator: true }
    }
}

impl OperatorConfig {
    pub fn watches(&self, namespace: &str) -> bool {
        self.watch_namespaces.is_empty() || self.watch_namespaces.iter().any(|n| n == namespace)
    }

    pub fn is_responsible_for(&self, kit: &Kit) -> bool {
        match kit.operator_id() {
            Some(id) if !id.is_empty() => id == self.operator_id,
            _ => self.default_operator,
        }
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("no platform found in namespace {0}")]
    NoneInNamespace(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Platform a kit binds to: the selector annotation, else the platform
/// recorded in status, else the namespace default (first Ready, then any).
pub async fn resolve_platform(store: &dyn ClusterStore, kit: &Kit) -> Result<Platform, PlatformError> {
    let ns = kit.namespace().unwrap_or_default();
    if let Some(name) = kit.platform_selector().filter(|s| !s.is_empty()) {
        return store
            .get_platform(&ns, name)
            .await?
            .ok_or_else(|| PlatformError::NotFound { namespace: ns.clone(), name: name.to_string() });
    }
    if let Some(name) = kit.status.as_ref().and_then(|s| s.platform.as_deref()).filter(|s| !s.is_empty()) {
        if let Some(p) = store.get_platform(&ns, name).await? {
            return Ok(p);
        }
    }
    let mut platforms = store.list_platforms(&ns).await?;
    match platforms.iter().position(Platform::is_ready) {
        Some(i) => Ok(platforms.swap_remove(i)),
        None if !platforms.is_empty() => Ok(platforms.swap_remove(0)),
        None => Err(PlatformError::NoneInNamespace(ns)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{KitSpec, KitStatus, PlatformPhase, PlatformSpec, PlatformStatus, OPERATOR_ID_ANNOTATION};
    use kiln_core::PLATFORM_SELECTOR_ANNOTATION;
    use kiln_store::MemoryStore;

    fn kit() -> Kit {
        let mut k = Kit::new("a", KitSpec::default());
        k.metadata.namespace = Some("ns".into());
        k
    }

    fn platform(name: &str, phase: PlatformPhase) -> Platform {
        let mut p = Platform::new(name, PlatformSpec::default());
        p.metadata.namespace = Some("ns".into());
        p.status = Some(PlatformStatus { phase, catalogs: vec![] });
        p
    }

    #[test]
    fn ownership_follows_annotation_then_default_flag() {
        let cfg = OperatorConfig { operator_id: "kiln-a".into(), ..Default::default() };
        let mut k = kit();
        assert!(cfg.is_responsible_for(&k));
        assert!(!OperatorConfig { default_operator: false, ..cfg.clone() }.is_responsible_for(&k));
        k.annotations_mut().insert(OPERATOR_ID_ANNOTATION.into(), "kiln-b".into());
        assert!(!cfg.is_responsible_for(&k));
        k.annotations_mut().insert(OPERATOR_ID_ANNOTATION.into(), "kiln-a".into());
        assert!(cfg.is_responsible_for(&k));
    }

    #[test]
    fn empty_namespace_list_watches_everything() {
        let all = OperatorConfig::default();
        assert!(all.watches("anything"));
        let one = OperatorConfig { watch_namespaces: vec!["ns".into()], ..Default::default() };
        assert!(one.watches("ns"));
        assert!(!one.watches("other"));
    }

    #[tokio::test]
    async fn default_prefers_a_ready_platform() {
        let store = MemoryStore::new();
        store.put_platform(platform("creating", PlatformPhase::Creating));
        store.put_platform(platform("ready", PlatformPhase::Ready));
        let p = resolve_platform(&store, &kit()).await.unwrap();
        assert_eq!(p.name_any(), "ready");
    }

    #[tokio::test]
    async fn selector_must_exist_and_status_binding_is_sticky() {
        let store = MemoryStore::new();
        store.put_platform(platform("ready", PlatformPhase::Ready));
        store.put_platform(platform("bound", PlatformPhase::Creating));

        let mut k = kit();
        k.annotations_mut().insert(PLATFORM_SELECTOR_ANNOTATION.into(), "missing".into());
        let err = resolve_platform(&store, &k).await.unwrap_err();
        assert!(matches!(err, PlatformError::NotFound { .. }));

        let mut k = kit();
        k.status = Some(KitStatus { platform: Some("bound".into()), ..Default::default() });
        assert_eq!(resolve_platform(&store, &k).await.unwrap().name_any(), "bound");
    }

    #[tokio::test]
    async fn empty_namespace_is_an_error() {
        let store = MemoryStore::new();
        let err = resolve_platform(&store, &kit()).await.unwrap_err();
        assert_eq!(err.to_string(), "no platform found in namespace ns");
    }
}
