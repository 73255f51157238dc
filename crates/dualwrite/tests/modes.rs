#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duet_core::{
    Backend, BackendKind, DualWriterMode, GroupVersionResource, ListOptions, ListPage, RequestContext, Resource,
    ResourceInfo, StorageError, StorageResult, StreamHandle, Verb, WatchEvent, WatchOptions,
};
use duet_dualwrite::{DualWriter, RoutingPolicy, ShadowStatus};
use duet_legacy::{LegacyAdapter, SqliteStore};
use duet_unified::{UnifiedAdapter, UnifiedStore};
use serde_json::json;

fn info() -> ResourceInfo {
    ResourceInfo::new(GroupVersionResource::new("shorturl.grafana.app", "v1beta1", "shorturls"), "ShortURL", "short_url")
}

/// Wraps a backend and fails or stalls calls on demand.
struct Faulty {
    inner: Arc<dyn Backend>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    stall_writes: AtomicBool,
    /// Holds back the next update for a while, then lets it through.
    delay_next_update: AtomicBool,
}

impl Faulty {
    fn new(inner: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            stall_writes: AtomicBool::new(false),
            delay_next_update: AtomicBool::new(false),
        })
    }

    async fn write_gate(&self) -> StorageResult<()> {
        if self.stall_writes.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(self.inner.kind(), "injected write failure"));
        }
        Ok(())
    }

    fn read_gate(&self) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(self.inner.kind(), "injected read failure"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for Faulty {
    fn kind(&self) -> BackendKind { self.inner.kind() }

    fn resource(&self) -> &ResourceInfo { self.inner.resource() }

    async fn create(&self, obj: Resource) -> StorageResult<Resource> {
        self.write_gate().await?;
        self.inner.create(obj).await
    }

    async fn get(&self, namespace: &str, name: &str) -> StorageResult<Resource> {
        self.read_gate()?;
        self.inner.get(namespace, name).await
    }

    async fn list(&self, opts: &ListOptions) -> StorageResult<ListPage> {
        self.read_gate()?;
        self.inner.list(opts).await
    }

    async fn update(&self, obj: Resource, expected_rv: Option<&str>) -> StorageResult<Resource> {
        if self.delay_next_update.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.write_gate().await?;
        self.inner.update(obj, expected_rv).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> StorageResult<bool> {
        self.write_gate().await?;
        self.inner.delete(namespace, name).await
    }

    async fn watch(&self, opts: WatchOptions) -> StorageResult<StreamHandle<WatchEvent>> {
        self.read_gate()?;
        self.inner.watch(opts).await
    }
}

struct Env {
    writer: DualWriter,
    legacy: Arc<Faulty>,
    unified: Arc<Faulty>,
}

impl Env {
    fn new(mode: DualWriterMode) -> Self { Self::with_shadow_timeout(mode, Duration::from_millis(200)) }

    fn with_shadow_timeout(mode: DualWriterMode, timeout: Duration) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let legacy = Faulty::new(Arc::new(LegacyAdapter::new(store, info())));
        let unified = Faulty::new(Arc::new(UnifiedAdapter::new(Arc::new(UnifiedStore::new()), info())));
        let writer = DualWriter::new(
            RoutingPolicy::for_mode(mode),
            legacy.clone() as Arc<dyn Backend>,
            unified.clone() as Arc<dyn Backend>,
        )
        .with_shadow_timeout(timeout);
        Self { writer, legacy, unified }
    }

    /// Direct read from one backend, bypassing the gates.
    async fn raw(&self, kind: BackendKind, ns: &str, name: &str) -> StorageResult<Resource> {
        match kind {
            BackendKind::Legacy => self.legacy.inner.get(ns, name).await,
            BackendKind::Unified => self.unified.inner.get(ns, name).await,
        }
    }

    fn gate(&self, kind: BackendKind) -> &Faulty {
        match kind {
            BackendKind::Legacy => self.legacy.as_ref(),
            BackendKind::Unified => self.unified.as_ref(),
        }
    }
}

fn shorturl(ns: &str, name: &str, path: &str) -> Resource {
    Resource::new(&info(), ns, name, json!({"uid": "x", "path": path}))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_after_write_and_idempotent_delete_in_every_mode() {
    for mode in DualWriterMode::ALL {
        let env = Env::new(mode);
        let ctx = RequestContext::new();
        let created = env.writer.create(&ctx, shorturl("default", "test-shorturl", "/d/a")).await.unwrap();
        assert!(!created.is_degraded(), "mode {mode}");
        let got = env.writer.get(&ctx, "default", "test-shorturl").await.unwrap();
        assert_eq!(got.generation(), 1, "mode {mode}");
        assert_eq!(got.spec, json!({"uid": "x", "path": "/d/a"}));
        assert!(!got.resource_version().is_empty());
        assert_eq!(got.resource_version(), created.value.resource_version());

        let mut edit = got.clone();
        edit.spec["path"] = json!("/d/b");
        let updated = env.writer.update(&ctx, "default", "test-shorturl", edit).await.unwrap().into_inner();
        assert_ne!(updated.resource_version(), got.resource_version(), "mode {mode}");
        assert_eq!(updated.generation(), 2);
        let got = env.writer.get(&ctx, "default", "test-shorturl").await.unwrap();
        assert_eq!(got.spec["path"], json!("/d/b"));

        // Every write target holds the same uid and spec.
        let policy = RoutingPolicy::for_mode(mode);
        for kind in [BackendKind::Legacy, BackendKind::Unified] {
            let raw = env.raw(kind, "default", "test-shorturl").await;
            if policy.writes_to(kind) {
                let raw = raw.unwrap();
                assert_eq!(raw.uid(), got.uid(), "mode {mode} {kind}");
                assert_eq!(raw.spec, got.spec);
            } else {
                assert!(raw.unwrap_err().is_not_found(), "mode {mode} {kind} must stay untouched");
            }
        }

        let deleted = env.writer.delete(&ctx, "default", "test-shorturl").await.unwrap();
        assert!(deleted.value);
        let err = env.writer.get(&ctx, "default", "test-shorturl").await.unwrap_err();
        assert!(err.is_not_found(), "mode {mode}");
        let again = env.writer.delete(&ctx, "default", "test-shorturl").await.unwrap();
        assert!(!again.value);
        assert!(env.writer.delete(&ctx, "default", "never-existed").await.is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_update_conflicts_only_where_legacy_is_authoritative() {
    for mode in DualWriterMode::ALL {
        let env = Env::new(mode);
        let ctx = RequestContext::new();
        env.writer.create(&ctx, shorturl("default", "shared", "/d/a")).await.unwrap();
        let a = env.writer.get(&ctx, "default", "shared").await.unwrap();
        let b = a.clone();

        let mut a_edit = a.clone();
        a_edit.spec["title"] = json!("from a");
        let after_a = env.writer.update(&ctx, "default", "shared", a_edit).await.unwrap().into_inner();

        let mut b_edit = b.clone();
        b_edit.spec["title"] = json!("from b");
        let res = env.writer.update(&ctx, "default", "shared", b_edit).await;
        let stored = env.writer.get(&ctx, "default", "shared").await.unwrap();
        match mode {
            DualWriterMode::Mode0 | DualWriterMode::Mode1 | DualWriterMode::Mode2 => {
                let err = res.unwrap_err();
                assert!(err.is_conflict(), "mode {mode}: {err}");
                assert!(err.to_string().contains("the object has been modified"));
                assert_eq!(stored.spec["title"], json!("from a"));
                assert_eq!(stored.resource_version(), after_a.resource_version());
            }
            _ => {
                let after_b = res.unwrap().into_inner();
                assert_ne!(after_b.resource_version(), after_a.resource_version(), "mode {mode}");
                assert_eq!(stored.spec["title"], json!("from b"));
            }
        }
    }
}

#[tokio::test]
async fn update_without_resource_version_is_unconditional() {
    let env = Env::new(DualWriterMode::Mode0);
    let ctx = RequestContext::new();
    env.writer.create(&ctx, shorturl("default", "a", "/d/a")).await.unwrap();
    let mut blind = shorturl("default", "a", "/d/blind");
    blind.metadata.resource_version.clear();
    let out = env.writer.update(&ctx, "default", "a", blind).await.unwrap().into_inner();
    assert_eq!(out.spec["path"], json!("/d/blind"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn namespaces_are_isolated_and_cross_namespace_update_is_not_found() {
    for mode in DualWriterMode::ALL {
        let env = Env::new(mode);
        let ctx = RequestContext::new();
        env.writer.create(&ctx, shorturl("default", "same", "/one")).await.unwrap();
        env.writer.create(&ctx, shorturl("org-2", "same", "/two")).await.unwrap();

        let one = env.writer.get(&ctx, "default", "same").await.unwrap();
        let two = env.writer.get(&ctx, "org-2", "same").await.unwrap();
        assert_eq!(one.spec["path"], json!("/one"), "mode {mode}");
        assert_eq!(two.spec["path"], json!("/two"));
        assert_ne!(one.uid(), two.uid());

        let page = env.writer.list(&ctx, &ListOptions::namespaced("org-2")).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].namespace(), "org-2");
        assert!(env.writer.get(&ctx, "org-3", "same").await.unwrap_err().is_not_found());
        for alias in ["org-02", "org-+2"] {
            assert!(env.writer.get(&ctx, alias, "same").await.unwrap_err().is_not_found(), "mode {mode} {alias}");
            assert!(env.writer.list(&ctx, &ListOptions::namespaced(alias)).await.unwrap().items.is_empty());
        }

        // Body addressed at org-2, request addressed at default.
        let mut moved = two.clone();
        moved.spec["path"] = json!("/hijack");
        let err = env.writer.update(&ctx, "default", "same", moved).await.unwrap_err();
        assert!(err.is_not_found(), "mode {mode}: {err}");
        let one = env.writer.get(&ctx, "default", "same").await.unwrap();
        assert_eq!(one.spec["path"], json!("/one"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generate_name_yields_distinct_names_in_both_backends() {
    for mode in [DualWriterMode::Mode0, DualWriterMode::Mode2, DualWriterMode::Mode4] {
        let env = Env::new(mode);
        let ctx = RequestContext::new();
        let mut names = HashSet::new();
        for _ in 0..100 {
            let obj = Resource::with_generate_name(&info(), "default", "test-", json!({"path": "/x"}));
            let created = env.writer.create(&ctx, obj).await.unwrap().into_inner();
            assert!(created.name().starts_with("test-"));
            assert_eq!(created.name().len(), "test-".len() + 5);
            names.insert(created.name().to_string());
        }
        assert_eq!(names.len(), 100, "mode {mode}");

        let policy = RoutingPolicy::for_mode(mode);
        if let Some(shadow) = policy.shadow() {
            for name in names.iter().take(10) {
                assert!(env.raw(shadow, "default", name).await.is_ok(), "mode {mode}: {name} missing in {shadow}");
            }
        }
    }
}

#[tokio::test]
async fn best_effort_shadow_failure_is_reported_and_queued() {
    let env = Env::new(DualWriterMode::Mode1);
    let ctx = RequestContext::new();
    env.unified.fail_writes.store(true, Ordering::SeqCst);

    let out = env.writer.create(&ctx, shorturl("default", "a", "/d/a")).await.unwrap();
    assert!(out.is_degraded());
    assert!(matches!(out.shadow, ShadowStatus::Failed { backend: BackendKind::Unified, .. }));
    assert!(env.raw(BackendKind::Legacy, "default", "a").await.is_ok());
    assert!(env.raw(BackendKind::Unified, "default", "a").await.unwrap_err().is_not_found());

    let queued = env.writer.reconcile_queue().drain();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].name, "a");
    assert_eq!(queued[0].verb, Verb::Create);
    assert_eq!(queued[0].backend, BackendKind::Unified);
}

#[tokio::test]
async fn strict_dual_write_surfaces_shadow_failure_without_rollback() {
    for mode in [DualWriterMode::Mode2, DualWriterMode::Mode3] {
        let env = Env::new(mode);
        let ctx = RequestContext::new();
        let shadow = RoutingPolicy::for_mode(mode).shadow().unwrap();
        env.gate(shadow).fail_writes.store(true, Ordering::SeqCst);

        let err = env.writer.create(&ctx, shorturl("default", "a", "/d/a")).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable { .. }), "mode {mode}: {err}");
        // The authoritative copy stays and is flagged for repair.
        let primary = RoutingPolicy::for_mode(mode).primary();
        assert!(env.raw(primary, "default", "a").await.is_ok());
        assert_eq!(env.writer.reconcile_queue().len(), 1);
    }
}

#[tokio::test]
async fn primary_failure_aborts_before_the_shadow_is_touched() {
    let env = Env::new(DualWriterMode::Mode4);
    let ctx = RequestContext::new();
    env.unified.fail_writes.store(true, Ordering::SeqCst);
    let err = env.writer.create(&ctx, shorturl("default", "a", "/d/a")).await.unwrap_err();
    assert_eq!(err.status_code(), 503);
    assert!(env.raw(BackendKind::Legacy, "default", "a").await.unwrap_err().is_not_found());
    assert!(env.writer.reconcile_queue().is_empty());
}

#[tokio::test]
async fn delete_succeeds_when_only_the_shadow_fails() {
    let env = Env::new(DualWriterMode::Mode2);
    let ctx = RequestContext::new();
    env.writer.create(&ctx, shorturl("default", "a", "/d/a")).await.unwrap();
    env.unified.fail_writes.store(true, Ordering::SeqCst);

    let out = env.writer.delete(&ctx, "default", "a").await.unwrap();
    assert!(out.value);
    assert!(out.is_degraded());
    let queued = env.writer.reconcile_queue().drain();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].verb, Verb::Delete);
}

#[tokio::test]
async fn stalled_shadow_is_dropped_after_the_shadow_timeout() {
    let env = Env::new(DualWriterMode::Mode1);
    let ctx = RequestContext::new();
    env.unified.stall_writes.store(true, Ordering::SeqCst);
    let out = tokio::time::timeout(Duration::from_secs(5), env.writer.create(&ctx, shorturl("default", "a", "/d/a")))
        .await
        .expect("shadow must not block the caller")
        .unwrap();
    match out.shadow {
        ShadowStatus::Failed { error, .. } => assert_eq!(error, StorageError::DeadlineExceeded),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn cancelled_request_writes_nothing() {
    let env = Env::new(DualWriterMode::Mode2);
    let ctx = RequestContext::new();
    ctx.cancel();
    let err = env.writer.create(&ctx, shorturl("default", "a", "/d/a")).await.unwrap_err();
    assert_eq!(err, StorageError::Cancelled);
    assert!(env.raw(BackendKind::Legacy, "default", "a").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn reads_never_touch_the_shadow() {
    let env = Env::new(DualWriterMode::Mode1);
    let ctx = RequestContext::new();
    env.writer.create(&ctx, shorturl("default", "a", "/d/a")).await.unwrap();
    env.unified.fail_reads.store(true, Ordering::SeqCst);
    assert!(env.writer.get(&ctx, "default", "a").await.is_ok());
    assert_eq!(env.writer.list(&ctx, &ListOptions::all()).await.unwrap().items.len(), 1);
}

#[tokio::test]
async fn invalid_names_are_rejected_before_any_backend_call() {
    let env = Env::new(DualWriterMode::Mode2);
    let ctx = RequestContext::new();
    env.legacy.fail_writes.store(true, Ordering::SeqCst);
    let err = env.writer.create(&ctx, shorturl("default", "Not_Valid", "/d/a")).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    let nameless = Resource::new(&info(), "default", "", json!({}));
    assert!(matches!(env.writer.create(&ctx, nameless).await, Err(StorageError::BadRequest(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_follows_the_read_target() {
    let legacy_mode = Env::new(DualWriterMode::Mode1);
    let ctx = RequestContext::new();
    match legacy_mode.writer.watch(&ctx, WatchOptions::default()).await {
        Err(e) => assert_eq!(e.status_code(), 400),
        Ok(_) => panic!("legacy-authoritative watch must be rejected"),
    }

    let env = Env::new(DualWriterMode::Mode4);
    let mut handle = env.writer.watch(&ctx, WatchOptions::default()).await.unwrap();
    env.writer.create(&ctx, shorturl("default", "w", "/d/w")).await.unwrap();
    let ev = tokio::time::timeout(Duration::from_secs(2), handle.rx.recv()).await.unwrap().unwrap();
    assert!(matches!(ev, WatchEvent::Added(ref o) if o.name() == "w"));
    handle.cancel.cancel();
}

#[tokio::test]
async fn create_always_mints_a_fresh_uid() {
    for mode in [DualWriterMode::Mode0, DualWriterMode::Mode2, DualWriterMode::Mode5] {
        let env = Env::new(mode);
        let ctx = RequestContext::new();
        let a = env.writer.create(&ctx, shorturl("default", "a", "/d/a")).await.unwrap().into_inner();
        env.writer.delete(&ctx, "default", "a").await.unwrap();

        let mut b = shorturl("default", "b", "/d/b");
        b.metadata.uid = a.uid().to_string();
        b.metadata.creation_timestamp = Some("2000-01-01T00:00:00Z".into());
        let b = env.writer.create(&ctx, b).await.unwrap().into_inner();
        let mut c = shorturl("org-2", "c", "/d/c");
        c.metadata.uid = a.uid().to_string();
        let c = env.writer.create(&ctx, c).await.unwrap().into_inner();

        assert_ne!(b.uid(), a.uid(), "mode {mode}");
        assert_ne!(c.uid(), a.uid(), "mode {mode}");
        assert_ne!(b.uid(), c.uid(), "mode {mode}");
        assert_ne!(b.metadata.creation_timestamp.as_deref(), Some("2000-01-01T00:00:00Z"));
        if let Some(shadow) = RoutingPolicy::for_mode(mode).shadow() {
            assert_eq!(env.raw(shadow, "default", "b").await.unwrap().uid(), b.uid(), "mode {mode}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_updates_leave_the_shadow_on_the_latest_primary_state() {
    for mode in [DualWriterMode::Mode1, DualWriterMode::Mode4] {
        let env = Arc::new(Env::with_shadow_timeout(mode, Duration::from_secs(5)));
        let ctx = RequestContext::new();
        env.writer.create(&ctx, shorturl("default", "a", "/d/a")).await.unwrap();
        let policy = RoutingPolicy::for_mode(mode);
        let (primary, shadow) = (policy.primary(), policy.shadow().unwrap());
        env.gate(shadow).delay_next_update.store(true, Ordering::SeqCst);

        // The first update's shadow write is held back until the second one has finished.
        let first = {
            let env = Arc::clone(&env);
            tokio::spawn(async move {
                let mut body = shorturl("default", "a", "/d/a");
                body.spec["title"] = json!("first");
                env.writer.update(&RequestContext::new(), "default", "a", body).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut body = shorturl("default", "a", "/d/a");
        body.spec["title"] = json!("second");
        let second = env.writer.update(&ctx, "default", "a", body).await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.shadow, ShadowStatus::Synced, "mode {mode}");
        assert_eq!(second.shadow, ShadowStatus::Synced, "mode {mode}");

        let authoritative = env.raw(primary, "default", "a").await.unwrap();
        let copy = env.raw(shadow, "default", "a").await.unwrap();
        assert_eq!(authoritative.spec["title"], json!("second"), "mode {mode}");
        assert_eq!(copy.spec, authoritative.spec, "mode {mode}");
        assert_eq!(copy.uid(), authoritative.uid());
        assert!(env.writer.reconcile_queue().is_empty());
    }
}
