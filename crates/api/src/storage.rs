use std::sync::Arc;
use std::time::Instant;

use duet_core::{
    ListOptions, ListPage, RequestContext, Resource, ResourceInfo, StorageError, StorageResult, StreamHandle, Verb,
    WatchEvent, WatchOptions,
};
use duet_dualwrite::{DualWriter, Written};
use metrics::counter;
use tracing::info;

use crate::patch::apply_patch;
use crate::{Authorizer, Decision, Identity, ResourceIdentity};

/// Per-resource entry point: authorize, then route through the dual writer.
pub struct ResourceStorage {
    writer: Arc<DualWriter>,
    authz: Arc<dyn Authorizer>,
}

impl ResourceStorage {
    pub fn new(writer: Arc<DualWriter>, authz: Arc<dyn Authorizer>) -> Self { Self { writer, authz } }

    pub fn resource(&self) -> &ResourceInfo { self.writer.resource() }

    pub fn writer(&self) -> &Arc<DualWriter> { &self.writer }

    /// Runs before any backend call, so a denial looks the same whether or
    /// not the object exists.
    async fn authorize(&self, who: &Identity, verb: Verb, namespace: Option<&str>, name: Option<&str>) -> StorageResult<()> {
        let resource = self.resource().group_resource();
        let target = ResourceIdentity {
            resource: resource.clone(),
            namespace: namespace.map(str::to_string),
            name: name.map(str::to_string),
        };
        match self.authz.can_perform(who, verb, &target).await {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => {
                counter!("api_forbidden_total", 1u64, "resource" => resource.clone(), "verb" => verb.as_str());
                info!(subject = %who.subject, verb = %verb, resource = %resource, reason = %reason, "api: forbidden");
                Err(StorageError::Forbidden { verb: verb.to_string(), resource, reason })
            }
        }
    }

    pub async fn get(&self, ctx: &RequestContext, who: &Identity, namespace: &str, name: &str) -> StorageResult<Resource> {
        let t0 = Instant::now();
        self.authorize(who, Verb::Get, Some(namespace), Some(name)).await?;
        let obj = self.writer.get(ctx, namespace, name).await?;
        info!(name, took_ms = %t0.elapsed().as_millis(), "api: get ok");
        Ok(obj)
    }

    pub async fn list(&self, ctx: &RequestContext, who: &Identity, opts: &ListOptions) -> StorageResult<ListPage> {
        let t0 = Instant::now();
        self.authorize(who, Verb::List, opts.namespace.as_deref(), None).await?;
        let page = self.writer.list(ctx, opts).await?;
        info!(items = page.items.len(), more = page.continue_token.is_some(), took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(page)
    }

    pub async fn create(&self, ctx: &RequestContext, who: &Identity, obj: Resource) -> StorageResult<Written<Resource>> {
        self.authorize(who, Verb::Create, Some(obj.namespace()), None).await?;
        self.writer.create(ctx, obj).await
    }

    pub async fn update(
        &self,
        ctx: &RequestContext,
        who: &Identity,
        namespace: &str,
        name: &str,
        obj: Resource,
    ) -> StorageResult<Written<Resource>> {
        self.authorize(who, Verb::Update, Some(namespace), Some(name)).await?;
        self.writer.update(ctx, namespace, name, obj).await
    }

    /// Read, merge-patch, and write back. The write is conditional on the
    /// version that was read, or on `metadata.resourceVersion` in the patch.
    pub async fn patch(
        &self,
        ctx: &RequestContext,
        who: &Identity,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> StorageResult<Written<Resource>> {
        self.authorize(who, Verb::Patch, Some(namespace), Some(name)).await?;
        let current = self.writer.get(ctx, namespace, name).await?;
        let (mut next, precondition) = apply_patch(&current, patch)?;
        next.metadata.resource_version = precondition.unwrap_or_else(|| current.metadata.resource_version.clone());
        self.writer.update(ctx, namespace, name, next).await
    }

    pub async fn delete(&self, ctx: &RequestContext, who: &Identity, namespace: &str, name: &str) -> StorageResult<Written<bool>> {
        self.authorize(who, Verb::Delete, Some(namespace), Some(name)).await?;
        self.writer.delete(ctx, namespace, name).await
    }

    pub async fn watch(&self, ctx: &RequestContext, who: &Identity, opts: WatchOptions) -> StorageResult<StreamHandle<WatchEvent>> {
        self.authorize(who, Verb::Watch, opts.namespace.as_deref(), None).await?;
        self.writer.watch(ctx, opts).await
    }
}
