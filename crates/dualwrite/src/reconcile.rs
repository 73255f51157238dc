//! Pending shadow repairs, coalesced by object identity.

use std::collections::VecDeque;
use std::sync::Mutex;

use duet_core::{BackendKind, Verb};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Serialize;

/// A shadow write that failed and still has to be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileItem {
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub verb: Verb,
    /// Backend that missed the write.
    pub backend: BackendKind,
    pub error: String,
    /// RFC 3339 time of the failure.
    pub at: String,
}

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    map: FxHashMap<Key, ReconcileItem>,
    order: VecDeque<Key>,
    dropped: u64,
}

/// Bounded FIFO of [`ReconcileItem`]s keyed by resource/namespace/name.
///
/// A newer failure for the same identity replaces the older one in place,
/// since the replay always copies the current authoritative state.
pub struct ReconcileQueue {
    inner: Mutex<Inner>,
    cap: usize,
}

impl ReconcileQueue {
    pub fn with_capacity(cap: usize) -> Self { Self { inner: Mutex::new(Inner::default()), cap: cap.max(1) } }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn push(&self, item: ReconcileItem) {
        let key = (item.resource.clone(), item.namespace.clone(), item.name.clone());
        let mut g = self.lock();
        if !g.map.contains_key(&key) {
            if g.order.len() >= self.cap {
                if let Some(old) = g.order.pop_front() {
                    g.map.remove(&old);
                    g.dropped += 1;
                    counter!("dualwriter_reconcile_dropped_total", 1u64);
                }
            }
            g.order.push_back(key.clone());
        }
        g.map.insert(key, item);
    }

    /// Take every pending item, oldest first.
    pub fn drain(&self) -> Vec<ReconcileItem> {
        let mut g = self.lock();
        let mut out = Vec::with_capacity(g.order.len());
        while let Some(key) = g.order.pop_front() {
            if let Some(item) = g.map.remove(&key) {
                out.push(item);
            }
        }
        out
    }

    pub fn len(&self) -> usize { self.lock().map.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn dropped(&self) -> u64 { self.lock().dropped }
}
