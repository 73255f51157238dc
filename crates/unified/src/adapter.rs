use std::sync::Arc;
use std::time::Instant;

use duet_core::{
    Backend, BackendKind, ListOptions, ListPage, Resource, ResourceInfo, StorageResult, StreamHandle, WatchEvent,
    WatchOptions,
};
use metrics::histogram;

use crate::UnifiedStore;

const WATCH_CAP: usize = 256;

/// Serves one resource type out of a shared [`UnifiedStore`].
pub struct UnifiedAdapter {
    store: Arc<UnifiedStore>,
    info: ResourceInfo,
}

impl UnifiedAdapter {
    pub fn new(store: Arc<UnifiedStore>, info: ResourceInfo) -> Self { Self { store, info } }

    fn stamp(&self, mut obj: Resource) -> Resource {
        obj.api_version = self.info.gvr.api_version();
        obj.kind = self.info.kind.clone();
        obj
    }
}

#[async_trait::async_trait]
impl Backend for UnifiedAdapter {
    fn kind(&self) -> BackendKind { BackendKind::Unified }

    fn resource(&self) -> &ResourceInfo { &self.info }

    async fn create(&self, obj: Resource) -> StorageResult<Resource> {
        let t0 = Instant::now();
        let res = self.store.create(&self.info.gvr, self.stamp(obj));
        histogram!("unified_create_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn get(&self, namespace: &str, name: &str) -> StorageResult<Resource> {
        self.store.get(&self.info.gvr, namespace, name)
    }

    async fn list(&self, opts: &ListOptions) -> StorageResult<ListPage> {
        let t0 = Instant::now();
        let res = self.store.list(&self.info.gvr, opts);
        histogram!("unified_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn update(&self, obj: Resource, expected_rv: Option<&str>) -> StorageResult<Resource> {
        let t0 = Instant::now();
        let res = self.store.update(&self.info.gvr, obj, expected_rv);
        histogram!("unified_update_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn delete(&self, namespace: &str, name: &str) -> StorageResult<bool> {
        self.store.delete(&self.info.gvr, namespace, name)
    }

    async fn watch(&self, opts: WatchOptions) -> StorageResult<StreamHandle<WatchEvent>> {
        Ok(self.store.watch(&self.info.gvr, opts, WATCH_CAP))
    }
}
