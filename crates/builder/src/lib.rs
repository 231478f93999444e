//! Kiln builder: runs a Build's task list in order and reports the outcome
//! as a `BuildStatus`. The only task kind is jib containerization.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use kiln_core::{Build, BuildPhase, BuildStatus, TaskKind};
use kiln_store::ClusterStore;
use kube::ResourceExt;
use tracing::{info, warn};

pub mod jib;
pub mod process;
pub mod registry;

/// Builder tunables. `from_env` reads the `KILN_*` overrides.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Root for task context dirs that do not name one.
    pub work_dir: PathBuf,
    /// Shared root for per-invocation credential dirs.
    pub mount_root: PathBuf,
    /// External build command.
    pub command: String,
    /// Whole-pipeline deadline when the Build does not set one.
    pub timeout: Duration,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/kiln"),
            mount_root: std::env::temp_dir(),
            command: "./mvnw".into(),
            timeout: Duration::from_secs(600),
        }
    }
}

impl BuilderConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            work_dir: std::env::var_os("KILN_WORK_DIR").map(PathBuf::from).unwrap_or(d.work_dir),
            mount_root: std::env::var_os("KILN_MOUNT_ROOT").map(PathBuf::from).unwrap_or(d.mount_root),
            command: std::env::var("KILN_BUILD_CMD").ok().filter(|s| !s.is_empty()).unwrap_or(d.command),
            timeout: std::env::var("KILN_BUILD_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(d.timeout),
        }
    }
}

/// What a single task sees while it runs.
pub struct TaskContext<'a> {
    pub store: &'a dyn ClusterStore,
    pub namespace: &'a str,
    pub config: &'a BuilderConfig,
}

pub struct Builder<'a> {
    store: &'a dyn ClusterStore,
    config: &'a BuilderConfig,
}

impl<'a> Builder<'a> {
    pub fn new(store: &'a dyn ClusterStore, config: &'a BuilderConfig) -> Self {
        Self { store, config }
    }

    /// Execute every task of `build` and return the final status. Never
    /// errors: failures land in `BuildStatus.error` with phase `Failed`.
    pub async fn run(&self, build: &Build) -> BuildStatus {
        let started = Instant::now();
        let name = build.name_any();
        let deadline = build.spec.timeout_seconds.map(Duration::from_secs).unwrap_or(self.config.timeout);
        info!(build = %name, tasks = build.spec.tasks.len(), "build started");

        let mut status = match tokio::time::timeout(deadline, self.run_tasks(build)).await {
            Ok(s) => s,
            Err(_) => BuildStatus::default().failed(format!("build timed out after {}s", deadline.as_secs())),
        };
        status.duration = Some(format_duration(started.elapsed()));
        match status.phase {
            BuildPhase::Succeeded => info!(build = %name, image = ?status.image, duration = ?status.duration, "build succeeded"),
            _ => warn!(build = %name, error = ?status.error, "build failed"),
        }
        status
    }

    async fn run_tasks(&self, build: &Build) -> BuildStatus {
        if build.spec.tasks.is_empty() {
            return BuildStatus::default().failed("build has no tasks");
        }
        let namespace = build.namespace().unwrap_or_default();
        let ctx = TaskContext { store: self.store, namespace: &namespace, config: self.config };

        let mut ambient = BuildStatus::default();
        let mut last = BuildStatus::default();
        for (i, task) in build.spec.tasks.iter().enumerate() {
            last = match task.kind() {
                Some(TaskKind::Jib(jib)) => jib::containerize(&ctx, jib, &ambient).await,
                None => BuildStatus::default().failed(format!("task {} has no known kind", i)),
            };
            if last.phase != BuildPhase::Succeeded {
                // first failure halts the rest
                return last;
            }
            // the produced image is what the next task builds on
            ambient = BuildStatus {
                base_image: last.image.clone(),
                root_image: last.root_image.clone(),
                ..Default::default()
            };
        }
        last
    }
}

fn format_duration(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}
