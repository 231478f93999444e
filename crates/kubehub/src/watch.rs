//! The three subscriptions feeding the kit work queue.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::NamespaceResourceScope;
use kiln_core::{Build, Kit, ObjectKey, Platform, GROUP};
use kiln_store::ClusterStore;
use kube::{
    api::Api,
    runtime::watcher::{self},
    Client, Resource, ResourceExt,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::filter::{build_changed, kit_changed, platform_became_ready, should_wake, Change};
use crate::queue::WorkQueue;
use crate::tracker::ChangeTracker;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Restrict all subscriptions to one namespace; `None` watches cluster-wide.
    pub namespace: Option<String>,
    pub operator_id: String,
    pub backoff_max: Duration,
    pub channel_cap: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { namespace: None, operator_id: "kiln".into(), backoff_max: Duration::from_secs(30), channel_cap: 1024 }
    }
}

fn api_for<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// List+watch one kind and send tracked changes into a channel. Stream
/// errors are logged and retried with capped backoff; the task ends only
/// when the receiver goes away.
pub fn start_watcher<K>(api: Api<K>, kind: &'static str, cfg: &WatchConfig) -> mpsc::Receiver<Change<K>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel::<Change<K>>(cfg.channel_cap);
    let backoff_max = cfg.backoff_max;
    tokio::spawn(async move {
        let mut tracker = ChangeTracker::<K>::new();
        let mut backoff = Duration::from_secs(1);
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        info!(kind, "watcher started");
        loop {
            match stream.try_next().await {
                Ok(Some(ev)) => {
                    backoff = Duration::from_secs(1);
                    for change in tracker.observe(ev) {
                        if tx.send(change).await.is_err() {
                            debug!(kind, "change receiver dropped; stopping watcher");
                            return;
                        }
                    }
                }
                Ok(None) => {
                    warn!(kind, "watcher stream ended");
                    return;
                }
                Err(e) => {
                    warn!(kind, error = %e, backoff_secs = backoff.as_secs(), "watch error; retrying");
                    counter!("watch_errors_total", 1u64, "kind" => kind);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(backoff_max);
                }
            }
        }
    });
    rx
}

/// Kit that controls this build, read from its controller owner reference.
pub fn owner_kit(build: &Build) -> Option<ObjectKey> {
    let ns = build.namespace()?;
    build
        .owner_references()
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == "Kit" && o.api_version.starts_with(GROUP))
        .map(|o| ObjectKey::new(ns, o.name.clone()))
}

/// Kits in the platform's namespace that a platform turning Ready unblocks.
/// Listing failures are logged and yield nothing: the wake-up is best effort.
pub async fn wake_waiting_kits(store: &dyn ClusterStore, platform: &Platform, operator_id: &str) -> Vec<ObjectKey> {
    let ns = platform.namespace().unwrap_or_default();
    let name = platform.name_any();
    let kits = match store.list_kits(&ns).await {
        Ok(k) => k,
        Err(e) => {
            warn!(platform = %name, namespace = %ns, error = %e, "failed to list kits for wake-up");
            return Vec::new();
        }
    };
    let mut out = Vec::new();
    for kit in kits.iter() {
        if should_wake(kit, &name, operator_id) {
            info!(platform = %name, kit = %kit.name_any(), "platform ready, waking kit");
            out.push(ObjectKey::of(kit));
        } else {
            debug!(platform = %name, kit = %kit.name_any(), phase = %kit.phase(), "kit not blocked on this platform");
        }
    }
    counter!("wakeups_total", out.len() as u64);
    out
}

/// Spawn the kit, build and platform subscriptions. Returned handles end
/// when their watch streams do.
pub fn spawn_watchers(
    client: Client,
    store: Arc<dyn ClusterStore>,
    queue: Arc<WorkQueue>,
    cfg: WatchConfig,
) -> Vec<JoinHandle<()>> {
    let ns = cfg.namespace.as_deref();
    let mut kits = start_watcher(api_for::<Kit>(client.clone(), ns), "Kit", &cfg);
    let mut builds = start_watcher(api_for::<Build>(client.clone(), ns), "Build", &cfg);
    let mut platforms = start_watcher(api_for::<Platform>(client, ns), "Platform", &cfg);

    let q = Arc::clone(&queue);
    let kit_task = tokio::spawn(async move {
        while let Some(change) = kits.recv().await {
            if kit_changed(&change) {
                q.add(ObjectKey::of(change.object()));
            }
        }
    });

    let q = Arc::clone(&queue);
    let build_task = tokio::spawn(async move {
        while let Some(change) = builds.recv().await {
            if !build_changed(&change) {
                continue;
            }
            match owner_kit(change.object()) {
                Some(owner) => q.add(owner),
                None => debug!(build = %change.object().name_any(), "build without kit owner; ignoring"),
            }
        }
    });

    let operator_id = cfg.operator_id.clone();
    let platform_task = tokio::spawn(async move {
        while let Some(change) = platforms.recv().await {
            if !platform_became_ready(&change) {
                continue;
            }
            for key in wake_waiting_kits(store.as_ref(), change.object(), &operator_id).await {
                queue.add(key);
            }
        }
    });

    vec![kit_task, build_task, platform_task]
}
