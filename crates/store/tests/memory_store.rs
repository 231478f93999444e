#![forbid(unsafe_code)]

use kiln_core::{Build, BuildPhase, BuildSpec, BuildStatus, Kit, KitPhase, KitSpec, KitStatus, ObjectKey};
use kiln_store::{ClusterStore, MemoryStore};

fn kit(ns: &str, name: &str) -> Kit {
    let mut k = Kit::new(name, KitSpec::default());
    k.metadata.namespace = Some(ns.to_string());
    k
}

#[tokio::test]
async fn status_patch_with_stale_version_is_a_conflict() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("ns", "a");
    store.put_kit(kit("ns", "a"));

    let base = store.get_kit(&key).await.unwrap().unwrap();
    let mut target = base.clone();
    target.status_mut().phase = KitPhase::WaitingForPlatform;
    store.patch_kit_status(&base, &target).await.expect("first write");

    // Second writer still holds the old version.
    let mut other = base.clone();
    other.status_mut().phase = KitPhase::Error;
    let err = store.patch_kit_status(&base, &other).await.unwrap_err();
    assert!(err.is_conflict(), "got {err}");

    let stored = store.get_kit(&key).await.unwrap().unwrap();
    assert_eq!(stored.phase(), KitPhase::WaitingForPlatform);
    assert_eq!(store.kit_status_writes(), 1);
}

#[tokio::test]
async fn spec_edits_bump_generation_and_keep_status() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("ns", "a");
    let first = store.put_kit(kit("ns", "a"));
    assert_eq!(first.generation(), Some(1));
    store.set_kit_status(&key, KitStatus { phase: KitPhase::Ready, ..Default::default() });

    // Same spec: no generation bump.
    let same = store.put_kit(kit("ns", "a"));
    assert_eq!(same.generation(), Some(1));

    let mut edited = kit("ns", "a");
    edited.spec.dependencies.push("mvn:org.acme:lib:1.0".into());
    let edited = store.put_kit(edited);
    assert_eq!(edited.generation(), Some(2));
    assert_eq!(edited.phase(), KitPhase::Ready);
    assert_eq!(edited.metadata.uid, first.metadata.uid);
}

#[tokio::test]
async fn status_patch_removes_cleared_fields() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("ns", "a");
    store.put_kit(kit("ns", "a"));
    store.set_kit_status(
        &key,
        KitStatus { phase: KitPhase::Error, failure: Some("boom".into()), ..Default::default() },
    );

    let base = store.get_kit(&key).await.unwrap().unwrap();
    let mut target = base.clone();
    target.status_mut().phase = KitPhase::WaitingForPlatform;
    target.status_mut().failure = None;
    let stored = store.patch_kit_status(&base, &target).await.unwrap();
    let status = stored.status.unwrap();
    assert_eq!(status.phase, KitPhase::WaitingForPlatform);
    assert_eq!(status.failure, None);
}

#[tokio::test]
async fn create_build_rejects_duplicates_and_patches_status() {
    let store = MemoryStore::new();
    let mut b = Build::new("kit-a", BuildSpec::default());
    b.metadata.namespace = Some("ns".into());
    let created = store.create_build(&b).await.unwrap();
    assert!(created.metadata.uid.is_some());
    assert!(matches!(store.create_build(&b).await, Err(kiln_store::StoreError::AlreadyExists(_))));

    let done = BuildStatus { phase: BuildPhase::Succeeded, image: Some("reg/img:1".into()), ..Default::default() };
    let patched = store.patch_build_status(&created, &done).await.unwrap();
    assert_eq!(patched.phase(), BuildPhase::Succeeded);
    assert!(store.patch_build_status(&created, &done).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn deleted_build_can_be_created_again() {
    let store = MemoryStore::new();
    let mut b = Build::new("kit-a", BuildSpec::default());
    b.metadata.namespace = Some("ns".into());
    let first = store.create_build(&b).await.unwrap();

    store.delete_build("ns", "kit-a").await.unwrap();
    assert!(store.get_build("ns", "kit-a").await.unwrap().is_none());
    // already gone
    store.delete_build("ns", "kit-a").await.unwrap();

    let second = store.create_build(&b).await.unwrap();
    assert_ne!(second.metadata.uid, first.metadata.uid);
}

#[tokio::test]
async fn forced_conflict_fails_one_status_write() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("ns", "a");
    store.put_kit(kit("ns", "a"));
    let base = store.get_kit(&key).await.unwrap().unwrap();
    let mut target = base.clone();
    target.status_mut().phase = KitPhase::WaitingForPlatform;

    store.conflict_next_status_write();
    assert!(store.patch_kit_status(&base, &target).await.unwrap_err().is_conflict());
    assert_eq!(store.kit_status_writes(), 0);
    store.patch_kit_status(&base, &target).await.unwrap();
    assert_eq!(store.kit_status_writes(), 1);
}

#[tokio::test]
async fn deleting_a_kit_collects_owned_builds() {
    let store = MemoryStore::new();
    let k = store.put_kit(kit("ns", "a"));
    let mut b = Build::new("kit-a", BuildSpec::default());
    b.metadata.namespace = Some("ns".into());
    b.metadata.owner_references = Some(vec![kube::Resource::controller_owner_ref(&k, &()).unwrap()]);
    store.put_build(b);

    store.delete_kit(&ObjectKey::new("ns", "a"));
    assert!(store.build(&ObjectKey::new("ns", "kit-a")).is_none());
}

#[tokio::test]
async fn missing_secret_is_not_found() {
    let store = MemoryStore::new();
    let err = store.get_secret_data("ns", "nope").await.unwrap_err();
    assert!(err.is_not_found());
}
