use std::sync::Arc;
use std::time::Duration;

use kiln_builder::BuilderConfig;
use kiln_core::{Kit, KitPhase, KitSpec, ObjectKey, KIT_TYPE_LABEL};
use kiln_controller::{spawn_workers, KitReconciler, LogEvents, OperatorConfig, RuntimeConfig};
use kiln_kubehub::WorkQueue;
use kiln_store::MemoryStore;
use kube::ResourceExt;

async fn wait_for_phase(store: &MemoryStore, key: &ObjectKey, phase: KitPhase) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.kit(key).map(|k| k.phase()) != Some(phase) {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {phase}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn workers_drain_the_queue_and_stop_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    for name in ["a", "b", "c"] {
        let mut k = Kit::new(name, KitSpec::default());
        k.metadata.namespace = Some("ns".into());
        k.labels_mut().insert(KIT_TYPE_LABEL.into(), "synthetic".into());
        k.spec.image = Some(format!("reg/{name}:1"));
        store.put_kit(k);
    }
    let reconciler = Arc::new(KitReconciler::new(
        store.clone(),
        Arc::new(LogEvents),
        OperatorConfig::default(),
        BuilderConfig::default(),
    ));
    let queue = Arc::new(WorkQueue::new());
    let cfg = RuntimeConfig { workers: 2, ..Default::default() };
    let handles = spawn_workers(reconciler, Arc::clone(&queue), cfg);

    // each phase step is re-triggered the way the kit watcher would
    for phase in [KitPhase::Initialization, KitPhase::Ready] {
        for name in ["a", "b", "c"] {
            queue.add(ObjectKey::new("ns", name));
        }
        for name in ["a", "b", "c"] {
            wait_for_phase(&store, &ObjectKey::new("ns", name), phase).await;
        }
    }
    assert_eq!(store.kit(&ObjectKey::new("ns", "b")).unwrap().status.unwrap().image.as_deref(), Some("reg/b:1"));

    queue.shutdown();
    for h in handles {
        tokio::time::timeout(Duration::from_secs(2), h).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn failed_pass_is_retried_with_backoff() {
    let store = Arc::new(MemoryStore::new());
    let mut k = Kit::new("a", KitSpec::default());
    k.metadata.namespace = Some("ns".into());
    store.put_kit(k);
    let reconciler = Arc::new(KitReconciler::new(
        store.clone(),
        Arc::new(LogEvents),
        OperatorConfig::default(),
        BuilderConfig::default(),
    ));
    let queue = Arc::new(WorkQueue::new());
    let cfg = RuntimeConfig {
        workers: 1,
        backoff_base: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
        ..Default::default()
    };
    let handles = spawn_workers(reconciler, Arc::clone(&queue), cfg);
    let key = ObjectKey::new("ns", "a");

    queue.add(key.clone());
    wait_for_phase(&store, &key, KitPhase::WaitingForPlatform).await;
    let writes = store.kit_status_writes();
    // no platform yet: the next pass fails and keeps retrying until one shows up
    queue.add(key.clone());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.kit_status_writes(), writes);

    let mut p = kiln_core::Platform::new("p", kiln_core::PlatformSpec::default());
    p.metadata.namespace = Some("ns".into());
    p.status = Some(kiln_core::PlatformStatus { phase: kiln_core::PlatformPhase::Ready, catalogs: vec![] });
    store.put_platform(p);
    wait_for_phase(&store, &key, KitPhase::Initialization).await;

    queue.shutdown();
    for h in handles {
        h.abort();
    }
}
