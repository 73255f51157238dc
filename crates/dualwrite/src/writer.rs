//! The dual writer: one logical operation -> the adapter calls its routing policy asks for.

use std::sync::Arc;
use std::time::{Duration, Instant};

use duet_core::names::{create_name, new_uid, now_rfc3339};
use duet_core::{
    Backend, BackendKind, ListOptions, ListPage, RequestContext, Resource, ResourceInfo, StorageError, StorageResult,
    StreamHandle, Verb, WatchEvent, WatchOptions,
};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::conflict::ConflictDetector;
use crate::mode::RoutingPolicy;
use crate::reconcile::{ReconcileItem, ReconcileQueue};
use crate::replicate::{replicate, ReplicaAction};

const DEFAULT_SHADOW_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RECONCILE_CAP: usize = 4_096;
const MAX_CONVERGE_ROUNDS: usize = 4;

/// Outcome of the shadow half of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowStatus {
    /// The mode writes to a single backend.
    NotConfigured,
    Synced,
    /// Authoritative write succeeded; the shadow did not and is queued for reconciliation.
    Failed { backend: BackendKind, error: StorageError },
}

/// Successful write result. Together with `Err` this distinguishes
/// success, success with a failed shadow, and authoritative failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Written<T> {
    pub value: T,
    pub shadow: ShadowStatus,
}

impl<T> Written<T> {
    pub fn into_inner(self) -> T { self.value }

    pub fn is_degraded(&self) -> bool { matches!(self.shadow, ShadowStatus::Failed { .. }) }
}

/// Routes reads and writes for one resource type across the legacy and unified backends.
pub struct DualWriter {
    resource: ResourceInfo,
    policy: RoutingPolicy,
    legacy: Arc<dyn Backend>,
    unified: Arc<dyn Backend>,
    detector: ConflictDetector,
    reconcile: Arc<ReconcileQueue>,
    shadow_timeout: Duration,
}

impl DualWriter {
    pub fn new(policy: RoutingPolicy, legacy: Arc<dyn Backend>, unified: Arc<dyn Backend>) -> Self {
        let resource = legacy.resource().clone();
        let detector = ConflictDetector::new(policy.conflict_policy);
        Self {
            resource,
            policy,
            legacy,
            unified,
            detector,
            reconcile: Arc::new(ReconcileQueue::with_capacity(DEFAULT_RECONCILE_CAP)),
            shadow_timeout: DEFAULT_SHADOW_TIMEOUT,
        }
    }

    /// Share one reconciliation queue across writers.
    pub fn with_reconcile_queue(mut self, queue: Arc<ReconcileQueue>) -> Self {
        self.reconcile = queue;
        self
    }

    pub fn with_shadow_timeout(mut self, timeout: Duration) -> Self {
        self.shadow_timeout = timeout;
        self
    }

    pub fn resource(&self) -> &ResourceInfo { &self.resource }
    pub fn policy(&self) -> &RoutingPolicy { &self.policy }
    pub fn reconcile_queue(&self) -> &Arc<ReconcileQueue> { &self.reconcile }

    pub fn backend(&self, kind: BackendKind) -> &Arc<dyn Backend> {
        match kind {
            BackendKind::Legacy => &self.legacy,
            BackendKind::Unified => &self.unified,
        }
    }

    /// The authoritative backend (also the read target).
    pub fn primary(&self) -> &Arc<dyn Backend> { self.backend(self.policy.primary()) }

    pub fn shadow(&self) -> Option<&Arc<dyn Backend>> { self.policy.shadow().map(|k| self.backend(k)) }

    fn resource_key(&self) -> String { self.resource.group_resource() }

    fn record_write(&self, verb: Verb, outcome: &'static str, error: &'static str, t0: Instant) {
        counter!(
            "dualwriter_write_total", 1u64,
            "mode" => self.policy.mode.to_string(),
            "resource" => self.resource_key(),
            "verb" => verb.as_str(),
            "outcome" => outcome,
            "error" => error
        );
        histogram!("dualwriter_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "verb" => verb.as_str());
    }

    fn record_read(&self, verb: Verb, t0: Instant) {
        counter!(
            "dualwriter_read_total", 1u64,
            "mode" => self.policy.mode.to_string(),
            "resource" => self.resource_key(),
            "verb" => verb.as_str()
        );
        histogram!("dualwriter_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "verb" => verb.as_str());
    }

    fn write_outcome<T>(&self, verb: Verb, t0: Instant, res: &StorageResult<Written<T>>) {
        let (outcome, error) = match res {
            Ok(Written { shadow: ShadowStatus::Failed { error, .. }, .. }) => ("degraded", error.reason()),
            Ok(_) => ("ok", ""),
            Err(e) => ("error", e.reason()),
        };
        self.record_write(verb, outcome, error, t0);
    }

    /// Note a failed shadow write and queue the identity for repair.
    fn shadow_failed(&self, verb: Verb, backend: BackendKind, namespace: &str, name: &str, error: &StorageError) {
        warn!(
            mode = %self.policy.mode, resource = %self.resource_key(), backend = %backend,
            namespace, name, verb = %verb, error = %error,
            "dualwriter: shadow write failed"
        );
        counter!(
            "dualwriter_shadow_failed_total", 1u64,
            "mode" => self.policy.mode.to_string(),
            "resource" => self.resource_key(),
            "verb" => verb.as_str()
        );
        self.reconcile.push(ReconcileItem {
            resource: self.resource_key(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            verb,
            backend,
            error: error.to_string(),
            at: now_rfc3339(),
        });
    }

    /// Copy the primary's result into the shadow, bounded by the shadow timeout.
    async fn sync_shadow(&self, ctx: &RequestContext, verb: Verb, stored: &Resource) -> StorageResult<ShadowStatus> {
        let Some(shadow) = self.shadow() else {
            return Ok(ShadowStatus::NotConfigured);
        };
        let sctx = ctx.child(Some(self.shadow_timeout));
        match sctx.run(self.converge(shadow.as_ref(), stored)).await {
            Ok(action) => {
                debug!(backend = %shadow.kind(), name = %stored.name(), action = action.as_str(), "dualwriter: shadow synced");
                Ok(ShadowStatus::Synced)
            }
            Err(error) => {
                self.shadow_failed(verb, shadow.kind(), stored.namespace(), stored.name(), &error);
                if self.policy.require_both_succeed {
                    return Err(error);
                }
                Ok(ShadowStatus::Failed { backend: shadow.kind(), error })
            }
        }
    }

    /// Replicate `stored`, then re-read the primary until the copy written to
    /// the shadow is the primary's current state. A concurrent writer whose
    /// older state lands on the shadow last is overwritten here.
    async fn converge(&self, shadow: &dyn Backend, stored: &Resource) -> StorageResult<ReplicaAction> {
        let mut action = replicate(shadow, stored).await?;
        let mut synced_rv = stored.resource_version().to_string();
        for _ in 0..MAX_CONVERGE_ROUNDS {
            match self.primary().get(stored.namespace(), stored.name()).await {
                Ok(latest) if latest.resource_version() == synced_rv => return Ok(action),
                Ok(latest) => {
                    debug!(
                        name = %stored.name(), synced = %synced_rv, latest = %latest.resource_version(),
                        "dualwriter: primary moved during shadow sync; replaying"
                    );
                    action = replicate(shadow, &latest).await?;
                    synced_rv = latest.resource_version().to_string();
                }
                Err(e) if e.is_not_found() => {
                    shadow.delete(stored.namespace(), stored.name()).await?;
                    return Ok(action);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::unavailable(shadow.kind(), "shadow did not converge with the primary"))
    }

    /// Create in the primary (which resolves generateName and mints the
    /// resourceVersion), then in the shadow under the same name and uid.
    pub async fn create(&self, ctx: &RequestContext, mut obj: Resource) -> StorageResult<Written<Resource>> {
        let t0 = Instant::now();
        let res = async {
            create_name(&obj.metadata)?;
            // Server-owned identity: a caller-supplied uid or timestamp is never kept.
            obj.metadata.uid = new_uid();
            obj.metadata.creation_timestamp = None;
            obj.metadata.resource_version.clear();
            let created = ctx.run(self.primary().create(obj)).await?;
            let shadow = self.sync_shadow(ctx, Verb::Create, &created).await?;
            Ok::<_, StorageError>(Written { value: created, shadow })
        }
        .await;
        self.write_outcome(Verb::Create, t0, &res);
        if let Ok(w) = &res {
            info!(took_ms = %t0.elapsed().as_millis(), mode = %self.policy.mode, resource = %self.resource_key(), name = %w.value.name(), "dualwriter: create ok");
        }
        res
    }

    pub async fn get(&self, ctx: &RequestContext, namespace: &str, name: &str) -> StorageResult<Resource> {
        let t0 = Instant::now();
        let res = ctx.run(self.primary().get(namespace, name)).await;
        self.record_read(Verb::Get, t0);
        res
    }

    pub async fn list(&self, ctx: &RequestContext, opts: &ListOptions) -> StorageResult<ListPage> {
        let t0 = Instant::now();
        let res = ctx.run(self.primary().list(opts)).await;
        self.record_read(Verb::List, t0);
        res
    }

    /// Conflict-check against the primary, write the primary, then propagate
    /// to the shadow. `obj` must address `namespace`/`name`.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        obj: Resource,
    ) -> StorageResult<Written<Resource>> {
        let t0 = Instant::now();
        let res = async {
            if obj.namespace() != namespace || obj.name() != name {
                return Err(StorageError::not_found(&self.resource_key(), name));
            }
            let primary = self.primary();
            let current = ctx.run(primary.get(namespace, name)).await?;
            let expected = Some(obj.resource_version()).filter(|rv| !rv.is_empty());
            let cas = self.detector.evaluate(&self.resource_key(), expected, &current)?;
            let mut body = obj;
            if body.metadata.uid.is_empty() {
                body.metadata.uid = current.metadata.uid.clone();
            }
            let updated = ctx.run(primary.update(body, cas.as_deref())).await?;
            let shadow = self.sync_shadow(ctx, Verb::Update, &updated).await?;
            Ok::<_, StorageError>(Written { value: updated, shadow })
        }
        .await;
        self.write_outcome(Verb::Update, t0, &res);
        if let Ok(w) = &res {
            info!(
                took_ms = %t0.elapsed().as_millis(), mode = %self.policy.mode, resource = %self.resource_key(),
                name, rv = %w.value.resource_version(), "dualwriter: update ok"
            );
        }
        res
    }

    /// Delete from every write target concurrently. Absence is success; only
    /// a primary failure fails the call.
    pub async fn delete(&self, ctx: &RequestContext, namespace: &str, name: &str) -> StorageResult<Written<bool>> {
        let t0 = Instant::now();
        let sctx = ctx.child(Some(self.shadow_timeout));
        let primary = ctx.run(self.primary().delete(namespace, name));
        let shadow = async {
            match self.shadow() {
                Some(s) => Some((s.kind(), sctx.run(s.delete(namespace, name)).await)),
                None => None,
            }
        };
        let (primary, shadow) = futures::join!(primary, shadow);
        let res = primary.map(|deleted| {
            let shadow = match shadow {
                None => ShadowStatus::NotConfigured,
                Some((_, Ok(_))) => ShadowStatus::Synced,
                Some((backend, Err(error))) => {
                    self.shadow_failed(Verb::Delete, backend, namespace, name, &error);
                    ShadowStatus::Failed { backend, error }
                }
            };
            Written { value: deleted, shadow }
        });
        self.write_outcome(Verb::Delete, t0, &res);
        if let Ok(w) = &res {
            info!(took_ms = %t0.elapsed().as_millis(), mode = %self.policy.mode, resource = %self.resource_key(), name, existed = w.value, "dualwriter: delete ok");
        }
        res
    }

    /// Watch the read target.
    pub async fn watch(&self, ctx: &RequestContext, opts: WatchOptions) -> StorageResult<StreamHandle<WatchEvent>> {
        let t0 = Instant::now();
        let res = ctx.run(self.primary().watch(opts)).await;
        self.record_read(Verb::Watch, t0);
        res
    }
}
