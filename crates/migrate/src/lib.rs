//! Duet migration coordinator.
//!
//! Copies every object of one resource type from the old authoritative
//! backend into the new one, page by page. Runs are idempotent and can be
//! resumed from the continuation token of the last completed page.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use duet_core::names::now_rfc3339;
use duet_core::{Backend, ListOptions, RequestContext, Resource, StorageError, StorageResult};
use duet_dualwrite::{replicate, DualWriter, ReconcileItem, ReconcileQueue, ReplicaAction};
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

pub const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_RECORDED_FAILURES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectFailure {
    pub namespace: String,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub listed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub recreated: u64,
    pub failed: u64,
    /// Token of the last fully processed page; `None` once the source is exhausted.
    pub last_continue: Option<String>,
    /// False when the run stopped early on cancellation or deadline.
    pub complete: bool,
    /// First failures, capped.
    pub failures: Vec<ObjectFailure>,
}

impl MigrationReport {
    fn count(&mut self, action: ReplicaAction) {
        match action {
            ReplicaAction::Created => self.created += 1,
            ReplicaAction::Updated => self.updated += 1,
            ReplicaAction::Unchanged => self.unchanged += 1,
            ReplicaAction::Recreated => self.recreated += 1,
        }
    }

    fn fail(&mut self, obj: &Resource, error: &StorageError) {
        self.failed += 1;
        if self.failures.len() < MAX_RECORDED_FAILURES {
            self.failures.push(ObjectFailure {
                namespace: obj.namespace().to_string(),
                name: obj.name().to_string(),
                error: error.to_string(),
            });
        }
    }
}

/// Result of comparing every source object with the destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub checked: u64,
    /// `namespace/name` absent from the destination.
    pub missing: Vec<String>,
    /// `namespace/name` present with a different uid or spec.
    pub mismatched: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool { self.missing.is_empty() && self.mismatched.is_empty() }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub replayed: u64,
    pub deleted: u64,
    /// Items that failed again and were queued back.
    pub requeued: u64,
    /// Items for other resource types, left in the queue.
    pub skipped: u64,
}

fn interrupted(e: &StorageError) -> bool { matches!(e, StorageError::Cancelled | StorageError::DeadlineExceeded) }

pub struct Migrator {
    source: Arc<dyn Backend>,
    dest: Arc<dyn Backend>,
    page_size: usize,
}

impl Migrator {
    pub fn new(source: Arc<dyn Backend>, dest: Arc<dyn Backend>) -> Self {
        Self { source, dest, page_size: DEFAULT_PAGE_SIZE }
    }

    /// Authoritative backend of `writer` as source, its shadow as destination.
    pub fn for_writer(writer: &DualWriter) -> Option<Self> {
        let shadow = writer.shadow()?;
        Some(Self::new(Arc::clone(writer.primary()), Arc::clone(shadow)))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn resource_key(&self) -> String { self.source.resource().group_resource() }

    /// Replay every source object into the destination, starting after `resume`.
    ///
    /// Per-object failures are counted and skipped. Cancellation stops the run
    /// with `complete = false`; `last_continue` then resumes it.
    pub async fn run(&self, ctx: &RequestContext, resume: Option<String>) -> StorageResult<MigrationReport> {
        let t0 = Instant::now();
        let resource = self.resource_key();
        let mut report = MigrationReport { last_continue: resume.clone(), ..Default::default() };
        let mut token = resume;
        info!(resource = %resource, from = self.source.kind().as_str(), to = self.dest.kind().as_str(), resumed = token.is_some(), "migrate: start");
        loop {
            let opts = ListOptions::all().with_limit(self.page_size).with_continue(token.clone());
            let page = match ctx.run(self.source.list(&opts)).await {
                Ok(p) => p,
                Err(e) if interrupted(&e) => {
                    warn!(resource = %resource, error = %e, "migrate: interrupted");
                    return Ok(report);
                }
                Err(e) => return Err(e),
            };
            for obj in &page.items {
                report.listed += 1;
                match ctx.run(replicate(self.dest.as_ref(), obj)).await {
                    Ok(action) => {
                        counter!("migration_objects_total", 1u64, "resource" => resource.clone(), "action" => action.as_str());
                        report.count(action);
                    }
                    Err(e) if interrupted(&e) => {
                        // The current page is replayed on resume; replay is idempotent.
                        warn!(resource = %resource, error = %e, "migrate: interrupted");
                        return Ok(report);
                    }
                    Err(e) => {
                        counter!("migration_objects_total", 1u64, "resource" => resource.clone(), "action" => "failed");
                        warn!(resource = %resource, namespace = %obj.namespace(), name = %obj.name(), error = %e, "migrate: object failed");
                        report.fail(obj, &e);
                    }
                }
            }
            report.last_continue = page.continue_token.clone();
            info!(resource = %resource, listed = report.listed, failed = report.failed, "migrate: page done");
            match page.continue_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        report.complete = true;
        info!(
            took_ms = %t0.elapsed().as_millis(), resource = %resource, listed = report.listed,
            created = report.created, updated = report.updated, unchanged = report.unchanged,
            recreated = report.recreated, failed = report.failed, "migrate: done"
        );
        Ok(report)
    }

    /// Check that every source object exists in the destination with the same uid and spec.
    pub async fn verify(&self, ctx: &RequestContext) -> StorageResult<VerifyReport> {
        let mut report = VerifyReport::default();
        let mut token = None;
        loop {
            let opts = ListOptions::all().with_limit(self.page_size).with_continue(token);
            let page = ctx.run(self.source.list(&opts)).await?;
            for obj in &page.items {
                report.checked += 1;
                let id = format!("{}/{}", obj.namespace(), obj.name());
                match ctx.run(self.dest.get(obj.namespace(), obj.name())).await {
                    Ok(d) if d.uid() == obj.uid() && d.spec == obj.spec => {}
                    Ok(_) => report.mismatched.push(id),
                    Err(e) if e.is_not_found() => report.missing.push(id),
                    Err(e) => return Err(e),
                }
            }
            token = page.continue_token;
            if token.is_none() {
                break;
            }
        }
        info!(resource = %self.resource_key(), checked = report.checked, missing = report.missing.len(), mismatched = report.mismatched.len(), "migrate: verify done");
        Ok(report)
    }

    /// Replay queued shadow failures for this resource: copy the current
    /// source state into the destination, or delete it there when the
    /// source no longer has the object. Failures go back into the queue.
    pub async fn reconcile(&self, ctx: &RequestContext, queue: &ReconcileQueue) -> StorageResult<ReconcileReport> {
        let resource = self.resource_key();
        let mut report = ReconcileReport::default();
        let mut requeue: Vec<ReconcileItem> = Vec::new();
        for item in queue.drain() {
            if item.resource != resource || item.backend != self.dest.kind() {
                report.skipped += 1;
                requeue.push(item);
                continue;
            }
            let res = match ctx.run(self.source.get(&item.namespace, &item.name)).await {
                Ok(obj) => ctx.run(replicate(self.dest.as_ref(), &obj)).await.map(|_| false),
                Err(e) if e.is_not_found() => ctx.run(self.dest.delete(&item.namespace, &item.name)).await.map(|_| true),
                Err(e) => Err(e),
            };
            match res {
                Ok(true) => report.deleted += 1,
                Ok(false) => report.replayed += 1,
                Err(e) => {
                    warn!(resource = %resource, namespace = %item.namespace, name = %item.name, error = %e, "migrate: reconcile failed");
                    report.requeued += 1;
                    requeue.push(ReconcileItem {
                        error: e.to_string(),
                        at: now_rfc3339(),
                        ..item
                    });
                }
            }
        }
        for item in requeue {
            queue.push(item);
        }
        info!(resource = %resource, replayed = report.replayed, deleted = report.deleted, requeued = report.requeued, "migrate: reconcile done");
        Ok(report)
    }
}
