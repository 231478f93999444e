//! Containerization task: layers the build output onto a base image with jib.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use kiln_core::{BuildPhase, BuildStatus, JibTask};
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use crate::process::run_and_log;
use crate::registry::RegistryMount;
use crate::TaskContext;

/// Default context directory, relative to the working directory.
pub const CONTEXT_DIR: &str = "context";
/// Shared working area next to the context directory.
pub const BUILD_DIR: &str = "maven";
/// Build arguments written by an earlier task.
pub const COMMAND_ARGS_FILE: &str = "MAVEN_CONTEXT";
/// Digest written by jib, relative to the build directory.
pub const DIGEST_FILE: &str = "target/jib-image.digest";
/// Directory the external tool reads registry credentials from.
pub const REGISTRY_CONFIG_ENV: &str = "DOCKER_CONFIG";

const GOAL: &str = "jib:build";
const PROFILE: &str = "jib";
const TO_IMAGE: &str = "-Djib.to.image=";
const FROM_IMAGE: &str = "-Djib.from.image=";
const BASE_IMAGE_CACHE: &str = "-Djib.baseImageCache=";
const FROM_PLATFORMS: &str = "-Djib.from.platforms=";
const INSECURE_REGISTRIES: &str = "-Djib.allowInsecureRegistries=";
const SECRET_PREFIX: &str = "jib-secret-";

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.is_empty())
}

/// Context directory for the task: explicit, else `<work_dir>/context`.
pub fn context_dir(task: &JibTask, work_dir: &Path) -> PathBuf {
    match non_empty(task.context_dir.as_deref()) {
        Some(d) => PathBuf::from(d),
        None => work_dir.join(CONTEXT_DIR),
    }
}

/// Shared working area: the `maven` sibling of the context directory.
pub fn build_dir(context_dir: &Path) -> PathBuf {
    context_dir.parent().unwrap_or_else(|| Path::new(".")).join(BUILD_DIR)
}

/// Whether `dir` exists and holds at least one entry.
pub async fn has_content(dir: &Path) -> Result<bool> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("reading context dir {}", dir.display())),
    };
    Ok(entries
        .next_entry()
        .await
        .with_context(|| format!("reading context dir {}", dir.display()))?
        .is_some())
}

/// Full argument list: goal, handed-off arguments, profile, target and base
/// images, cache location, and the optional platform and insecure flags.
pub fn jib_args(task: &JibTask, handoff: &str, base_image: &str, build_dir: &Path) -> Vec<String> {
    let mut args = vec![GOAL.to_string()];
    args.extend(handoff.split_whitespace().map(str::to_string));
    args.push("-P".into());
    args.push(PROFILE.into());
    args.push(format!("{}{}", TO_IMAGE, task.image));
    args.push(format!("{}{}", FROM_IMAGE, base_image));
    args.push(format!("{}{}", BASE_IMAGE_CACHE, build_dir.join("jib").display()));
    if !task.configuration.image_platforms.is_empty() {
        args.push(format!("{}{}", FROM_PLATFORMS, task.configuration.image_platforms.join(",")));
    }
    if task.registry.insecure {
        args.push(format!("{}true", INSECURE_REGISTRIES));
    }
    args
}

/// Run the task against the ambient status carried from earlier tasks.
pub async fn containerize(ctx: &TaskContext<'_>, task: &JibTask, ambient: &BuildStatus) -> BuildStatus {
    let started = Instant::now();
    let base_image = non_empty(ambient.base_image.as_deref()).unwrap_or(&task.base_image).to_string();
    let root_image = non_empty(ambient.root_image.as_deref()).unwrap_or(&task.base_image).to_string();
    let mut status = BuildStatus {
        phase: BuildPhase::Running,
        base_image: Some(base_image.clone()),
        root_image: Some(root_image),
        ..Default::default()
    };

    let context_dir = context_dir(task, &ctx.config.work_dir);
    match has_content(&context_dir).await {
        Ok(true) => {}
        Ok(false) => {
            // Nothing to add on top of the base image.
            info!(task = %task.name, image = %base_image, "no new image to build, reusing existing image");
            counter!("build_reuse_total", 1u64);
            status.image = Some(base_image);
            status.phase = BuildPhase::Succeeded;
            return status;
        }
        Err(e) => return status.failed(format!("{:#}", e)),
    }

    let build_dir = build_dir(&context_dir);
    debug!(task = %task.name, registry = %task.registry.address, base_image = %base_image, "containerizing");

    let mount = match non_empty(task.registry.secret.as_deref()) {
        Some(secret) => {
            match RegistryMount::mount(ctx.store, ctx.namespace, &ctx.config.mount_root, SECRET_PREFIX, secret).await {
                Ok(m) => Some(m),
                Err(e) => return status.failed(format!("{:#}", e)),
            }
        }
        None => None,
    };

    let outcome = execute(ctx, task, &base_image, &build_dir, mount.as_ref()).await;
    histogram!("build_task_ms", started.elapsed().as_secs_f64() * 1000.0);

    match outcome {
        Err(e) => {
            error!(task = %task.name, error = %format!("{:#}", e), "image containerization did not run successfully");
            if let Some(m) = mount {
                if let Err(ce) = m.release().await {
                    warn!(task = %task.name, error = %format!("{:#}", ce), "credential cleanup failed");
                }
            }
            status.failed(format!("{:#}", e))
        }
        Ok(digest) => {
            debug!(task = %task.name, digest = %digest, "image containerization did run successfully");
            if let Some(m) = mount {
                if let Err(ce) = m.release().await {
                    return status.failed(format!("{:#}", ce));
                }
            }
            status.image = Some(task.image.clone());
            status.digest = Some(digest);
            status.phase = BuildPhase::Succeeded;
            status
        }
    }
}

async fn execute(
    ctx: &TaskContext<'_>,
    task: &JibTask,
    base_image: &str,
    build_dir: &Path,
    mount: Option<&RegistryMount>,
) -> Result<String> {
    let handoff_path = build_dir.join(COMMAND_ARGS_FILE);
    let handoff = tokio::fs::read_to_string(&handoff_path)
        .await
        .with_context(|| format!("reading build arguments from {}", handoff_path.display()))?;
    let args = jib_args(task, &handoff, base_image, build_dir);

    // The tool writes its default config here; keep it inside the build dir.
    let mut envs: Vec<(&str, PathBuf)> = vec![("XDG_CONFIG_HOME", build_dir.join("jib"))];
    if let Some(m) = mount {
        envs.push((REGISTRY_CONFIG_ENV, m.path().to_path_buf()));
    }
    run_and_log(&ctx.config.command, &args, build_dir, &envs).await?;

    let digest_path = build_dir.join(DIGEST_FILE);
    let digest = tokio::fs::read_to_string(&digest_path)
        .await
        .with_context(|| format!("reading image digest from {}", digest_path.display()))?;
    let digest = digest.trim();
    if digest.is_empty() {
        bail!("image digest file {} is empty", digest_path.display());
    }
    Ok(digest.to_string())
}
