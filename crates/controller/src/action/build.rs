use std::path::Path;

use anyhow::{anyhow, bail, Context};
use kiln_builder::{jib, Builder};
use kiln_core::conditions::{self, BUILD_COMPLETE};
use kiln_core::{
    Build, BuildPhase, BuildSpec, Condition, ConditionStatus, JibTask, Kit, KitPhase, Platform, TaskSpec,
    KIT_GENERATION_ANNOTATION,
};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::ActionContext;

/// Name of the Build a kit owns.
pub fn build_name(kit: &Kit) -> String {
    format!("kit-{}", kit.name_any())
}

pub(super) fn can_handle(kit: &Kit) -> bool {
    matches!(kit.phase(), KitPhase::BuildSubmitted | KitPhase::BuildRunning)
}

pub(super) async fn handle(ctx: &ActionContext<'_>, kit: &Kit) -> anyhow::Result<Option<Kit>> {
    match kit.phase() {
        KitPhase::BuildSubmitted => submit(ctx, kit).await.map(Some),
        _ => track(ctx, kit).await,
    }
}

fn target_image(kit: &Kit, platform: &Platform) -> String {
    let ns = kit.namespace().unwrap_or_default();
    let repo = format!("{}/kit-{}:{}", ns, kit.name_any(), kit.generation().unwrap_or_default());
    match platform.spec.build.registry.address.trim_end_matches('/') {
        "" => repo,
        addr => format!("{}/{}", addr, repo),
    }
}

/// Context directory private to one kit's builds: `<work_dir>/<ns>/<build>/context`.
fn build_context_dir(kit: &Kit, work_dir: &Path) -> String {
    work_dir
        .join(kit.namespace().unwrap_or_default())
        .join(build_name(kit))
        .join(jib::CONTEXT_DIR)
        .to_string_lossy()
        .into_owned()
}

fn desired_build(kit: &Kit, platform: &Platform, work_dir: &Path) -> anyhow::Result<Build> {
    let settings = &platform.spec.build;
    let task = JibTask {
        name: "jib".into(),
        context_dir: Some(build_context_dir(kit, work_dir)),
        image: target_image(kit, platform),
        base_image: settings.base_image.clone(),
        registry: settings.registry.clone(),
        configuration: kiln_core::BuildConfiguration { image_platforms: settings.image_platforms.clone() },
    };
    let mut build = Build::new(
        &build_name(kit),
        BuildSpec { tasks: vec![TaskSpec::jib(task)], timeout_seconds: settings.timeout_seconds },
    );
    build.metadata.namespace = kit.namespace();
    build
        .annotations_mut()
        .insert(KIT_GENERATION_ANNOTATION.into(), kit.generation().unwrap_or_default().to_string());
    let owner = kit
        .controller_owner_ref(&())
        .ok_or_else(|| anyhow!("kit {} has no uid yet", kit.name_any()))?;
    build.metadata.owner_references = Some(vec![owner]);
    Ok(build)
}

fn owned_by(build: &Build, kit: &Kit) -> bool {
    let uid = kit.uid();
    build.owner_references().iter().any(|o| o.controller == Some(true) && Some(&o.uid) == uid.as_ref())
}

fn submitted_generation(build: &Build) -> Option<i64> {
    build.annotations().get(KIT_GENERATION_ANNOTATION).and_then(|g| g.parse().ok())
}

/// The build was submitted for an older spec of the kit.
fn is_stale(build: &Build, kit: &Kit) -> bool {
    match (submitted_generation(build), kit.generation()) {
        (Some(built), Some(current)) => built < current,
        _ => false,
    }
}

/// Whether `existing` is the build `desired` asks for.
fn same_request(existing: &Build, desired: &Build) -> bool {
    existing.spec == desired.spec && submitted_generation(existing) == submitted_generation(desired)
}

async fn submit(ctx: &ActionContext<'_>, kit: &Kit) -> anyhow::Result<Kit> {
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

    let desired = desired_build(kit, &platform, &ctx.builder.work_dir)?;
    let name = build_name(kit);
    match ctx.store.create_build(&desired).await {
        Ok(_) => info!(kit = %kit.name_any(), build = %name, "build created"),
        Err(e) if e.is_already_exists() => {
            let existing = ctx
                .store
                .get_build(&ns, &name)
                .await
                .with_context(|| format!("reading build {}/{}", ns, name))?
                .ok_or_else(|| anyhow!("build {}/{} vanished while adopting it", ns, name))?;
            if !owned_by(&existing, kit) {
                bail!("build {}/{} exists and is not owned by kit {}", ns, name, kit.name_any());
            }
            if same_request(&existing, &desired) {
                debug!(kit = %kit.name_any(), build = %name, "adopting existing build");
            } else {
                // A submitted build never changes; replace it with one for the current spec.
                ctx.store
                    .delete_build(&ns, &name)
                    .await
                    .with_context(|| format!("deleting outdated build {}/{}", ns, name))?;
                ctx.store
                    .create_build(&desired)
                    .await
                    .with_context(|| format!("recreating build {}/{}", ns, name))?;
                info!(
                    kit = %kit.name_any(),
                    build = %name,
                    from = ?submitted_generation(&existing),
                    to = ?kit.generation(),
                    "outdated build replaced"
                );
            }
        }
        Err(e) => return Err(e).with_context(|| format!("creating build {}/{}", ns, name)),
    }

    let mut next = kit.clone();
    let st = next.status_mut();
    st.phase = KitPhase::BuildRunning;
    conditions::set(
        &mut st.conditions,
        Condition::new(BUILD_COMPLETE, ConditionStatus::False, "BuildRunning", format!("build {} submitted", name)),
    );
    Ok(next)
}

async fn track(ctx: &ActionContext<'_>, kit: &Kit) -> anyhow::Result<Option<Kit>> {
    let ns = kit.namespace().unwrap_or_default();
    let name = build_name(kit);
    let Some(build) = ctx
        .store
        .get_build(&ns, &name)
        .await
        .with_context(|| format!("reading build {}/{}", ns, name))?
    else {
        warn!(kit = %kit.name_any(), build = %name, "build disappeared");
        return Ok(Some(failed(kit, format!("build {} not found", name))));
    };

    if build.phase() == BuildPhase::Running {
        debug!(kit = %kit.name_any(), build = %name, "build running elsewhere");
        return Ok(None);
    }
    if is_stale(&build, kit) {
        info!(
            kit = %kit.name_any(),
            build = %name,
            built = ?submitted_generation(&build),
            generation = ?kit.generation(),
            "spec changed while building, restarting kit lifecycle"
        );
        let mut next = kit.clone();
        let st = next.status_mut();
        st.phase = KitPhase::WaitingForPlatform;
        st.failure = None;
        return Ok(Some(next));
    }

    let status = match build.phase() {
        BuildPhase::Running => return Ok(None),
        BuildPhase::Pending => {
            let status = Builder::new(ctx.store, ctx.builder).run(&build).await;
            ctx.store
                .patch_build_status(&build, &status)
                .await
                .with_context(|| format!("recording status of build {}/{}", ns, name))?;
            status
        }
        BuildPhase::Succeeded | BuildPhase::Failed => build.status.clone().unwrap_or_default(),
    };

    match status.phase {
        BuildPhase::Succeeded => {
            let mut next = kit.clone();
            let st = next.status_mut();
            st.phase = KitPhase::Ready;
            st.image = status.image.clone();
            st.image_digest = status.digest.clone();
            st.base_image = status.base_image.clone();
            st.root_image = status.root_image.clone();
            st.failure = None;
            conditions::set(
                &mut st.conditions,
                Condition::new(BUILD_COMPLETE, ConditionStatus::True, "BuildSucceeded", format!("build {} succeeded", name)),
            );
            Ok(Some(next))
        }
        _ => Ok(Some(failed(kit, status.error.unwrap_or_else(|| format!("build {} failed", name))))),
    }
}

fn failed(kit: &Kit, message: String) -> Kit {
    let mut next = kit.clone();
    let st = next.status_mut();
    st.phase = KitPhase::Error;
    conditions::set(
        &mut st.conditions,
        Condition::new(BUILD_COMPLETE, ConditionStatus::False, "BuildFailed", message.clone()),
    );
    st.failure = Some(message);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{KitSpec, KitStatus, PlatformSpec, RegistrySpec};

    fn kit() -> Kit {
        let mut k = Kit::new("a", KitSpec::default());
        k.metadata.namespace = Some("ns".into());
        k.metadata.uid = Some("uid-a".into());
        k.metadata.generation = Some(2);
        k.status = Some(KitStatus { phase: KitPhase::BuildSubmitted, platform: Some("p".into()), ..Default::default() });
        k
    }

    fn platform(address: &str) -> Platform {
        let mut p = Platform::new("p", PlatformSpec::default());
        p.spec.build.registry = RegistrySpec { address: address.into(), ..Default::default() };
        p.spec.build.base_image = "eclipse-temurin:17".into();
        p.spec.build.image_platforms = vec!["linux/amd64".into()];
        p.spec.build.timeout_seconds = Some(120);
        p
    }

    #[test]
    fn desired_build_is_owned_and_carries_platform_settings() {
        let b = desired_build(&kit(), &platform("registry.local/"), Path::new("/var/kiln")).unwrap();
        assert_eq!(b.name_any(), "kit-a");
        assert_eq!(b.namespace().as_deref(), Some("ns"));
        assert!(owned_by(&b, &kit()));
        assert_eq!(b.spec.timeout_seconds, Some(120));
        let jib = b.spec.tasks[0].jib.as_ref().unwrap();
        assert_eq!(jib.image, "registry.local/ns/kit-a:2");
        assert_eq!(jib.base_image, "eclipse-temurin:17");
        assert_eq!(jib.configuration.image_platforms, vec!["linux/amd64".to_string()]);
        assert_eq!(submitted_generation(&b), Some(2));
    }

    #[test]
    fn each_kit_builds_in_its_own_directory() {
        let work = Path::new("/var/kiln");
        let mut other = kit();
        other.metadata.name = Some("b".into());
        let a = desired_build(&kit(), &platform("r"), work).unwrap();
        let b = desired_build(&other, &platform("r"), work).unwrap();
        let dir = |b: &Build| jib::context_dir(b.spec.tasks[0].jib.as_ref().unwrap(), work);

        assert_eq!(dir(&a), work.join("ns").join("kit-a").join("context"));
        assert_ne!(dir(&a), dir(&b));
        assert_ne!(jib::build_dir(&dir(&a)), jib::build_dir(&dir(&b)));
    }

    #[test]
    fn build_for_an_older_generation_is_stale() {
        let b = desired_build(&kit(), &platform("r"), Path::new("/w")).unwrap();
        assert!(!is_stale(&b, &kit()));
        let mut edited = kit();
        edited.metadata.generation = Some(3);
        assert!(is_stale(&b, &edited));
        assert!(!same_request(&b, &desired_build(&edited, &platform("r"), Path::new("/w")).unwrap()));

        let mut unmarked = b.clone();
        unmarked.annotations_mut().clear();
        assert!(!is_stale(&unmarked, &edited));
    }

    #[test]
    fn image_without_registry_is_repository_relative() {
        assert_eq!(target_image(&kit(), &platform("")), "ns/kit-a:2");
    }

    #[test]
    fn kit_without_uid_cannot_own_a_build() {
        let mut k = kit();
        k.metadata.uid = None;
        assert!(desired_build(&k, &platform("r"), Path::new("/w")).is_err());
    }
}
