#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use duet_api::{AllowAll, Identity, Registry, ResourceStorage, Role, RoleAuthorizer};
use duet_core::{
    Backend, DualWriterMode, GroupVersionResource, ListOptions, RequestContext, Resource, ResourceInfo, StorageError,
    WatchEvent, WatchOptions,
};
use duet_dualwrite::{ConfigError, StorageConfig};
use duet_legacy::{LegacyAdapter, SqliteStore};
use duet_unified::{UnifiedAdapter, UnifiedStore};
use serde_json::json;

fn shorturls() -> ResourceInfo {
    ResourceInfo::new(GroupVersionResource::new("shorturl.grafana.app", "v1beta1", "shorturls"), "ShortURL", "short_url")
}

fn folders() -> ResourceInfo {
    ResourceInfo::new(GroupVersionResource::new("folder.grafana.app", "v1", "folders"), "Folder", "folder")
}

fn adapters(info: ResourceInfo, sqlite: &Arc<SqliteStore>, unified: &Arc<UnifiedStore>) -> (Arc<dyn Backend>, Arc<dyn Backend>) {
    (
        Arc::new(LegacyAdapter::new(Arc::clone(sqlite), info.clone())),
        Arc::new(UnifiedAdapter::new(Arc::clone(unified), info)),
    )
}

fn storage(mode: DualWriterMode, role_based: bool) -> Arc<ResourceStorage> {
    let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
    let unified = Arc::new(UnifiedStore::new());
    let (legacy, uni) = adapters(shorturls(), &sqlite, &unified);
    let cfg = StorageConfig::default().with_mode(&shorturls().group_resource(), mode);
    let authz: Arc<dyn duet_api::Authorizer> = if role_based { Arc::new(RoleAuthorizer::new()) } else { Arc::new(AllowAll) };
    let registry = Registry::builder(cfg).serve(legacy, uni).build(authz).unwrap();
    registry.storage(&shorturls().group_resource()).unwrap()
}

fn admin() -> Identity { Identity::cluster("admin", Role::Admin) }

#[tokio::test]
async fn forbidden_looks_the_same_whether_or_not_the_object_exists() {
    let s = storage(DualWriterMode::Mode2, true);
    let ctx = RequestContext::new();
    s.create(&ctx, &admin(), Resource::new(&shorturls(), "default", "exists", json!({"path": "/a"}))).await.unwrap();

    let outsider = Identity::new("bob", "org-2", Role::Admin);
    let on_existing = s.get(&ctx, &outsider, "default", "exists").await.unwrap_err();
    let on_missing = s.get(&ctx, &outsider, "default", "missing").await.unwrap_err();
    assert!(matches!(on_existing, StorageError::Forbidden { .. }));
    assert_eq!(on_existing, on_missing);
    assert_eq!(on_existing.status_code(), 403);

    let viewer = Identity::new("val", "default", Role::Viewer);
    assert!(s.get(&ctx, &viewer, "default", "exists").await.is_ok());
    let err = s.delete(&ctx, &viewer, "default", "exists").await.unwrap_err();
    assert!(matches!(err, StorageError::Forbidden { .. }));
    assert!(s.get(&ctx, &viewer, "default", "exists").await.is_ok());
}

#[tokio::test]
async fn denied_create_writes_nothing() {
    let s = storage(DualWriterMode::Mode1, true);
    let ctx = RequestContext::new();
    let viewer = Identity::new("val", "default", Role::Viewer);
    let err = s.create(&ctx, &viewer, Resource::new(&shorturls(), "default", "a", json!({}))).await.unwrap_err();
    assert!(matches!(err, StorageError::Forbidden { .. }));
    for kind in [duet_core::BackendKind::Legacy, duet_core::BackendKind::Unified] {
        let page = s.writer().backend(kind).list(&ListOptions::all()).await.unwrap();
        assert!(page.items.is_empty());
    }
}

#[tokio::test]
async fn editors_only_see_their_namespace() {
    let s = storage(DualWriterMode::Mode3, true);
    let ctx = RequestContext::new();
    for ns in ["default", "org-2"] {
        s.create(&ctx, &admin(), Resource::new(&shorturls(), ns, "same", json!({"ns": ns}))).await.unwrap();
    }
    let editor = Identity::new("eve", "org-2", Role::Editor);
    let page = s.list(&ctx, &editor, &ListOptions::namespaced("org-2")).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].spec["ns"], json!("org-2"));
    assert!(matches!(s.list(&ctx, &editor, &ListOptions::all()).await, Err(StorageError::Forbidden { .. })));
    assert!(matches!(s.get(&ctx, &editor, "default", "same").await, Err(StorageError::Forbidden { .. })));
}

#[tokio::test]
async fn merge_patch_updates_spec_and_labels() {
    for mode in [DualWriterMode::Mode0, DualWriterMode::Mode2, DualWriterMode::Mode5] {
        let s = storage(mode, false);
        let ctx = RequestContext::new();
        let created = s
            .create(&ctx, &admin(), Resource::new(&shorturls(), "default", "p", json!({"title": "old", "path": "/p"})))
            .await
            .unwrap()
            .into_inner();
        let patched = s
            .patch(&ctx, &admin(), "default", "p", &json!({"spec": {"title": "new"}, "metadata": {"labels": {"a": "b"}}}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(patched.spec, json!({"title": "new", "path": "/p"}), "mode {mode}");
        assert_eq!(patched.metadata.labels.get("a").map(String::as_str), Some("b"));
        assert_ne!(patched.resource_version(), created.resource_version());
        assert_eq!(patched.generation(), 2);
        assert_eq!(patched.uid(), created.uid());
    }
}

#[tokio::test]
async fn patch_with_stale_version_conflicts_in_legacy_modes() {
    let s = storage(DualWriterMode::Mode0, false);
    let ctx = RequestContext::new();
    let created = s
        .create(&ctx, &admin(), Resource::new(&shorturls(), "default", "p", json!({"title": "old"})))
        .await
        .unwrap()
        .into_inner();
    s.patch(&ctx, &admin(), "default", "p", &json!({"spec": {"title": "first"}})).await.unwrap();
    let stale = json!({"spec": {"title": "second"}, "metadata": {"resourceVersion": created.resource_version()}});
    let err = s.patch(&ctx, &admin(), "default", "p", &stale).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(s.patch(&ctx, &admin(), "default", "missing", &json!({"spec": {}})).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_is_served_only_once_unified_is_authoritative() {
    let ctx = RequestContext::new();
    let legacy_first = storage(DualWriterMode::Mode2, false);
    match legacy_first.watch(&ctx, &admin(), WatchOptions::default()).await {
        Err(StorageError::BadRequest(_)) => {}
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("watch must be rejected while legacy is authoritative"),
    }

    let s = storage(DualWriterMode::Mode5, false);
    let opts = WatchOptions { namespace: Some("default".into()), ..Default::default() };
    let mut handle = s.watch(&ctx, &admin(), opts).await.unwrap();
    s.create(&ctx, &admin(), Resource::new(&shorturls(), "default", "w", json!({}))).await.unwrap();
    s.delete(&ctx, &admin(), "default", "w").await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), handle.rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), handle.rx.recv()).await.unwrap().unwrap();
    assert!(matches!(first, WatchEvent::Added(_)));
    assert!(matches!(second, WatchEvent::Deleted(ref o) if o.name() == "w"));
    handle.cancel.cancel();
}

#[test]
fn registry_fails_fast_on_configuration_gaps() {
    let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
    let unified = Arc::new(UnifiedStore::new());

    let (l1, u1) = adapters(shorturls(), &sqlite, &unified);
    let (l2, u2) = adapters(folders(), &sqlite, &unified);
    let cfg = StorageConfig::default().with_mode(&shorturls().group_resource(), DualWriterMode::Mode1);
    let err = Registry::builder(cfg.clone()).serve(l1, u1).serve(l2, u2).build(Arc::new(AllowAll)).err().unwrap();
    assert!(matches!(err, ConfigError::MissingResource(ref r) if r == "folders.folder.grafana.app"));

    // Adapters for different resources cannot be paired.
    let (l1, _) = adapters(shorturls(), &sqlite, &unified);
    let (_, u2) = adapters(folders(), &sqlite, &unified);
    assert!(matches!(Registry::builder(cfg.clone()).serve(l1, u2).build(Arc::new(AllowAll)), Err(ConfigError::Invalid(_))));

    let (l1, u1) = adapters(shorturls(), &sqlite, &unified);
    let (l2, u2) = adapters(folders(), &sqlite, &unified);
    let cfg = cfg.with_mode(&folders().group_resource(), DualWriterMode::Mode4);
    let registry = Registry::builder(cfg).serve(l1, u1).serve(l2, u2).build(Arc::new(AllowAll)).unwrap();
    assert_eq!(registry.routes().len(), 2);
    let folders_storage = registry.storage("folders.folder.grafana.app").unwrap();
    assert_eq!(folders_storage.writer().policy().mode, DualWriterMode::Mode4);
    assert!(Arc::ptr_eq(folders_storage.writer().reconcile_queue(), registry.reconcile_queue()));
    assert!(registry.storage("dashboards.dashboard.grafana.app").is_none());
}
