//! Duet unified store: versioned objects keyed by group/version/resource,
//! namespace and name, with a single store-wide revision and watch streams.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use duet_core::list::ContinueToken;
use duet_core::names::{create_name, new_uid, now_rfc3339, MAX_GENERATE_ATTEMPTS};
use duet_core::{
    CancelHandle, GroupVersionResource, ListOptions, ListPage, Resource, StorageError, StorageResult, StreamHandle,
    WatchEvent, WatchOptions,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

mod adapter;
mod snapshot;

pub use adapter::UnifiedAdapter;
pub use snapshot::{default_snapshot_path, Snapshot, SnapshotEntry};

const EVENT_BUFFER: usize = 1024;

/// Event published on every committed write.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub gvr: GroupVersionResource,
    pub revision: u64,
    pub event: WatchEvent,
}

type Key = (String, String);

#[derive(Default)]
struct State {
    revision: u64,
    objects: FxHashMap<GroupVersionResource, BTreeMap<Key, Resource>>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

pub struct UnifiedStore {
    state: Mutex<State>,
    events: broadcast::Sender<StoredEvent>,
    revision_tx: watch::Sender<u64>,
    revision_rx: watch::Receiver<u64>,
}

impl Default for UnifiedStore {
    fn default() -> Self { Self::new() }
}

impl UnifiedStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (revision_tx, revision_rx) = watch::channel(0u64);
        Self { state: Mutex::new(State::default()), events, revision_tx, revision_rx }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Writers never panic while holding the lock; recover the data if one did.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, gvr: &GroupVersionResource, revision: u64, event: WatchEvent) {
        // No receivers is fine.
        let _ = self.events.send(StoredEvent { gvr: gvr.clone(), revision, event });
        let _ = self.revision_tx.send(revision);
    }

    /// Latest committed revision.
    pub fn revision(&self) -> u64 { self.lock().revision }

    /// Receiver that changes whenever a write commits.
    pub fn subscribe_revision(&self) -> watch::Receiver<u64> { self.revision_rx.clone() }

    pub fn create(&self, gvr: &GroupVersionResource, mut obj: Resource) -> StorageResult<Resource> {
        if obj.namespace().is_empty() {
            return Err(StorageError::BadRequest("metadata.namespace is required".into()));
        }
        let mut st = self.lock();
        let mut name = None;
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let (candidate, generated) = create_name(&obj.metadata)?;
            let taken = st
                .objects
                .get(gvr)
                .is_some_and(|m| m.contains_key(&(obj.namespace().to_string(), candidate.clone())));
            if !taken {
                name = Some(candidate);
                break;
            }
            if !generated {
                return Err(StorageError::already_exists(&gvr.group_resource(), &candidate));
            }
            debug!(name = %candidate, "generated name collided; retrying");
        }
        let name = name.ok_or_else(|| StorageError::already_exists(&gvr.group_resource(), obj.name()))?;
        let revision = st.bump();
        obj.metadata.name = name;
        obj.metadata.generate_name = None;
        if obj.metadata.uid.is_empty() {
            obj.metadata.uid = new_uid();
        }
        if obj.metadata.creation_timestamp.is_none() {
            obj.metadata.creation_timestamp = Some(now_rfc3339());
        }
        obj.metadata.resource_version = revision.to_string();
        obj.metadata.generation = 1;
        st.objects
            .entry(gvr.clone())
            .or_default()
            .insert((obj.namespace().to_string(), obj.name().to_string()), obj.clone());
        self.publish(gvr, revision, WatchEvent::Added(obj.clone()));
        counter!("unified_write_total", 1u64, "op" => "create");
        Ok(obj)
    }

    pub fn get(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> StorageResult<Resource> {
        let st = self.lock();
        st.objects
            .get(gvr)
            .and_then(|m| m.get(&(namespace.to_string(), name.to_string())))
            .cloned()
            .ok_or_else(|| StorageError::not_found(&gvr.group_resource(), name))
    }

    pub fn list(&self, gvr: &GroupVersionResource, opts: &ListOptions) -> StorageResult<ListPage> {
        let cursor = opts.cursor()?;
        let limit = opts.page_size();
        let st = self.lock();
        let mut page = ListPage { resource_version: st.revision.to_string(), ..Default::default() };
        let Some(objects) = st.objects.get(gvr) else {
            return Ok(page);
        };
        let lower = match &cursor {
            Some(tok) => Bound::Excluded((tok.namespace.clone(), tok.name.clone())),
            None => match &opts.namespace {
                Some(ns) => Bound::Included((ns.clone(), String::new())),
                None => Bound::Unbounded,
            },
        };
        for ((ns, _), obj) in objects.range((lower, Bound::Unbounded)) {
            if let Some(want) = &opts.namespace {
                if ns > want {
                    break;
                }
            }
            if !opts.matches(obj) {
                continue;
            }
            if limit.is_some_and(|l| page.items.len() >= l) {
                page.continue_token = page.items.last().map(|o| ContinueToken::after(o).encode());
                break;
            }
            page.items.push(obj.clone());
        }
        Ok(page)
    }

    pub fn update(&self, gvr: &GroupVersionResource, obj: Resource, expected_rv: Option<&str>) -> StorageResult<Resource> {
        let resource = gvr.group_resource();
        let key = (obj.namespace().to_string(), obj.name().to_string());
        let mut st = self.lock();
        let current = st
            .objects
            .get(gvr)
            .and_then(|m| m.get(&key))
            .cloned()
            .ok_or_else(|| StorageError::not_found(&resource, obj.name()))?;
        if let Some(expected) = expected_rv.filter(|rv| !rv.is_empty()) {
            if expected != current.resource_version() {
                return Err(StorageError::conflict(&resource, obj.name(), expected, current.resource_version()));
            }
        }
        if !obj.uid().is_empty() && obj.uid() != current.uid() {
            return Err(StorageError::conflict(&resource, obj.name(), expected_rv.unwrap_or_default(), current.resource_version()));
        }
        let mut next = current;
        next.apply_user_fields(&obj);
        let revision = st.bump();
        next.metadata.resource_version = revision.to_string();
        st.objects.entry(gvr.clone()).or_default().insert(key, next.clone());
        self.publish(gvr, revision, WatchEvent::Modified(next.clone()));
        counter!("unified_write_total", 1u64, "op" => "update");
        Ok(next)
    }

    /// Hard delete; the final state is published with a fresh revision.
    pub fn delete(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> StorageResult<bool> {
        let mut st = self.lock();
        let removed = st.objects.get_mut(gvr).and_then(|m| m.remove(&(namespace.to_string(), name.to_string())));
        let Some(mut obj) = removed else {
            return Ok(false);
        };
        let revision = st.bump();
        obj.metadata.resource_version = revision.to_string();
        self.publish(gvr, revision, WatchEvent::Deleted(obj));
        counter!("unified_write_total", 1u64, "op" => "delete");
        Ok(true)
    }

    /// Stream events for one resource type. With `send_initial`, current objects
    /// are replayed as `Added` first; live events older than that replay are skipped.
    pub fn watch(&self, gvr: &GroupVersionResource, opts: WatchOptions, cap: usize) -> StreamHandle<WatchEvent> {
        let (mut sub, initial, from_revision) = {
            let st = self.lock();
            let sub = self.events.subscribe();
            let initial: Vec<Resource> = if opts.send_initial {
                st.objects
                    .get(gvr)
                    .map(|m| m.values().filter(|o| opts.matches(o)).cloned().collect())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            (sub, initial, st.revision)
        };
        let (tx, rx) = mpsc::channel::<WatchEvent>(cap.max(1));
        let gvr = gvr.clone();
        let task = tokio::spawn(async move {
            info!(gvr = %gvr, initial = initial.len(), from_revision, "unified: watch started");
            for obj in initial {
                if tx.send(WatchEvent::Added(obj)).await.is_err() {
                    return;
                }
            }
            loop {
                match sub.recv().await {
                    Ok(ev) => {
                        if ev.gvr != gvr || ev.revision <= from_revision || !opts.matches(ev.event.object()) {
                            continue;
                        }
                        if tx.send(ev.event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Missed events cannot be replayed; the client must re-list.
                        warn!(gvr = %gvr, skipped = n, "unified: watcher lagged; closing stream");
                        counter!("unified_watch_lagged_total", 1u64);
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(gvr = %gvr, "unified: watch ended");
        });
        StreamHandle { rx, cancel: CancelHandle::new(task) }
    }
}
