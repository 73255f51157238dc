#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use duet_core::{Backend, GroupVersionResource, Resource, ResourceInfo, WatchEvent, WatchOptions};
use duet_unified::{UnifiedAdapter, UnifiedStore};

fn info(resource: &str) -> ResourceInfo {
    ResourceInfo::new(GroupVersionResource::new("example.grafana.app", "v1", resource), "Thing", resource)
}

async fn next(rx: &mut tokio::sync::mpsc::Receiver<WatchEvent>) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("watch event in time")
        .expect("stream open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_streams_initial_then_live_events() {
    let store = Arc::new(UnifiedStore::new());
    let things = UnifiedAdapter::new(Arc::clone(&store), info("things"));
    let others = UnifiedAdapter::new(Arc::clone(&store), info("others"));

    things.create(Resource::new(things.resource(), "default", "pre", serde_json::json!({}))).await.unwrap();

    let opts = WatchOptions { namespace: Some("default".into()), send_initial: true, ..Default::default() };
    let mut handle = things.watch(opts).await.unwrap();

    match next(&mut handle.rx).await {
        WatchEvent::Added(o) => assert_eq!(o.name(), "pre"),
        other => panic!("unexpected {:?}", other),
    }

    // Different resource type and different namespace are filtered out.
    others.create(Resource::new(others.resource(), "default", "x", serde_json::json!({}))).await.unwrap();
    things.create(Resource::new(things.resource(), "org-2", "y", serde_json::json!({}))).await.unwrap();

    let created = things.create(Resource::new(things.resource(), "default", "live", serde_json::json!({"v": 1}))).await.unwrap();
    match next(&mut handle.rx).await {
        WatchEvent::Added(o) => assert_eq!(o.name(), "live"),
        other => panic!("unexpected {:?}", other),
    }

    let mut upd = created.clone();
    upd.spec = serde_json::json!({"v": 2});
    let updated = things.update(upd, Some(created.resource_version())).await.unwrap();
    match next(&mut handle.rx).await {
        WatchEvent::Modified(o) => assert_eq!(o.resource_version(), updated.resource_version()),
        other => panic!("unexpected {:?}", other),
    }

    things.delete("default", "live").await.unwrap();
    match next(&mut handle.rx).await {
        WatchEvent::Deleted(o) => {
            assert_eq!(o.uid(), created.uid());
            assert_ne!(o.resource_version(), updated.resource_version());
        }
        other => panic!("unexpected {:?}", other),
    }

    handle.cancel.cancel();
}

#[tokio::test]
async fn revision_subscription_observes_commits() {
    let store = Arc::new(UnifiedStore::new());
    let things = UnifiedAdapter::new(Arc::clone(&store), info("things"));
    let mut rx = store.subscribe_revision();
    assert_eq!(*rx.borrow(), 0);
    things.create(Resource::new(things.resource(), "default", "a", serde_json::json!({}))).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), rx.changed()).await.unwrap().unwrap();
    assert_eq!(*rx.borrow(), store.revision());
}
