use anyhow::{anyhow, Context};
use kiln_core::{Kit, KitPhase};
use kube::ResourceExt;
use tracing::{debug, info};

use super::ActionContext;
use crate::catalog::{match_catalog, requested_runtime_version};

pub(super) fn can_handle(kit: &Kit) -> bool {
    matches!(kit.phase(), KitPhase::Initialization | KitPhase::WaitingForCatalog)
}

pub(super) async fn handle(ctx: &ActionContext<'_>, kit: &Kit) -> anyhow::Result<Option<Kit>> {
    let mut next = kit.clone();

    if kit.is_prebuilt() {
        let st = next.status_mut();
        match kit.spec.image.as_deref().filter(|i| !i.is_empty()) {
            Some(image) => {
                st.phase = KitPhase::Ready;
                st.image = Some(image.to_string());
                st.failure = None;
            }
            None => {
                st.phase = KitPhase::Error;
                st.failure = Some(format!("{:?} kit has no image", kit.kit_type()).to_lowercase());
            }
        }
        return Ok(Some(next));
    }

    if let Some(camel) = &kit.spec.traits.camel {
        if let Err(e) = camel.validate() {
            let st = next.status_mut();
            st.phase = KitPhase::Error;
            st.failure = Some(e.to_string());
            return Ok(Some(next));
        }
    }

    let ns = kit.namespace().unwrap_or_default();
    let bound = kit
        .status
        .as_ref()
        .and_then(|s| s.platform.clone())
        .ok_or_else(|| anyhow!("kit {} is not bound to a platform", kit.name_any()))?;
    let platform = ctx
        .store
        .get_platform(&ns, &bound)
        .await
        .with_context(|| format!("reading platform {}/{}", ns, bound))?
        .ok_or_else(|| anyhow!("platform {}/{} not found", ns, bound))?;

    let Some(requested) = requested_runtime_version(kit, &platform) else {
        let st = next.status_mut();
        st.phase = KitPhase::Error;
        st.failure = Some(format!("no runtime version requested by kit or platform {}", bound));
        return Ok(Some(next));
    };
    let catalogs = platform.status.as_ref().map(|s| s.catalogs.as_slice()).unwrap_or_default();

    match match_catalog(&requested, catalogs) {
        Some(version) => {
            info!(kit = %kit.name_any(), requested = %requested, resolved = %version, "runtime catalog found");
            let st = next.status_mut();
            st.runtime_version = Some(version);
            st.phase = KitPhase::BuildSubmitted;
            Ok(Some(next))
        }
        None if kit.phase() == KitPhase::WaitingForCatalog => {
            debug!(kit = %kit.name_any(), requested = %requested, "still waiting for catalog");
            Ok(None)
        }
        None => {
            info!(kit = %kit.name_any(), requested = %requested, platform = %bound, "no catalog for runtime version yet");
            next.status_mut().phase = KitPhase::WaitingForCatalog;
            Ok(Some(next))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_builder::BuilderConfig;
    use kiln_core::{CamelTrait, KitSpec, KitStatus, Platform, PlatformPhase, PlatformSpec, PlatformStatus, KIT_TYPE_LABEL};
    use kiln_store::MemoryStore;

    fn store_with_platform(catalogs: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        let mut p = Platform::new("p", PlatformSpec::default());
        p.metadata.namespace = Some("ns".into());
        p.spec.build.runtime_version = Some("3.x".into());
        p.status = Some(PlatformStatus {
            phase: PlatformPhase::Ready,
            catalogs: catalogs.iter().map(|s| s.to_string()).collect(),
        });
        store.put_platform(p);
        store
    }

    fn kit(phase: KitPhase) -> Kit {
        let mut k = Kit::new("a", KitSpec::default());
        k.metadata.namespace = Some("ns".into());
        k.status = Some(KitStatus { phase, platform: Some("p".into()), ..Default::default() });
        k
    }

    #[tokio::test]
    async fn external_kit_goes_ready_with_its_image_or_errors_without() {
        let store = MemoryStore::new();
        let cfg = BuilderConfig::default();
        let ctx = ActionContext { store: &store, builder: &cfg };

        let mut k = kit(KitPhase::Initialization);
        k.labels_mut().insert(KIT_TYPE_LABEL.into(), "external".into());
        k.spec.image = Some("quay.io/acme/app:1".into());
        let next = handle(&ctx, &k).await.unwrap().unwrap();
        assert_eq!(next.phase(), KitPhase::Ready);
        assert_eq!(next.status.unwrap().image.as_deref(), Some("quay.io/acme/app:1"));

        k.spec.image = None;
        let next = handle(&ctx, &k).await.unwrap().unwrap();
        assert_eq!(next.phase(), KitPhase::Error);
        assert_eq!(next.status.unwrap().failure.as_deref(), Some("external kit has no image"));
    }

    #[tokio::test]
    async fn listed_catalog_submits_the_build() {
        let store = store_with_platform(&["3.2.0", "3.8.1"]);
        let cfg = BuilderConfig::default();
        let ctx = ActionContext { store: &store, builder: &cfg };
        let next = handle(&ctx, &kit(KitPhase::Initialization)).await.unwrap().unwrap();
        assert_eq!(next.phase(), KitPhase::BuildSubmitted);
        assert_eq!(next.status.unwrap().runtime_version.as_deref(), Some("3.8.1"));
    }

    #[tokio::test]
    async fn missing_catalog_waits_once_then_stays_quiet() {
        let store = store_with_platform(&["2.16.0"]);
        let cfg = BuilderConfig::default();
        let ctx = ActionContext { store: &store, builder: &cfg };
        let next = handle(&ctx, &kit(KitPhase::Initialization)).await.unwrap().unwrap();
        assert_eq!(next.phase(), KitPhase::WaitingForCatalog);
        assert_eq!(handle(&ctx, &next).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_trait_is_a_kit_error() {
        let store = store_with_platform(&["3.8.1"]);
        let cfg = BuilderConfig::default();
        let ctx = ActionContext { store: &store, builder: &cfg };
        let mut k = kit(KitPhase::Initialization);
        k.spec.traits.camel = Some(CamelTrait { runtime_provider: Some("spring".into()), ..Default::default() });
        let next = handle(&ctx, &k).await.unwrap().unwrap();
        assert_eq!(next.phase(), KitPhase::Error);
        assert!(next.status.unwrap().failure.is_some());
    }

    #[tokio::test]
    async fn vanished_platform_is_an_action_error() {
        let store = MemoryStore::new();
        let cfg = BuilderConfig::default();
        let ctx = ActionContext { store: &store, builder: &cfg };
        let err = handle(&ctx, &kit(KitPhase::Initialization)).await.unwrap_err();
        assert!(err.to_string().contains("ns/p not found"));
    }
}
