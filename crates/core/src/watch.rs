//! Watch events and the streaming handle returned by watchable backends.

use serde::{Deserialize, Serialize};

use crate::{LabelSelector, Resource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
}

impl WatchEvent {
    pub fn object(&self) -> &Resource {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub namespace: Option<String>,
    pub label_selector: Option<LabelSelector>,
    /// Emit the current objects as `Added` before live events.
    pub send_initial: bool,
}

impl WatchOptions {
    pub fn matches(&self, obj: &Resource) -> bool {
        self.namespace.as_deref().map_or(true, |ns| obj.namespace() == ns)
            && self.label_selector.as_ref().map_or(true, |s| s.matches(&obj.metadata.labels))
    }
}

/// Cancellation handle that aborts the forwarding task.
pub struct CancelHandle {
    task: tokio::task::JoinHandle<()>,
}

impl CancelHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self { Self { task } }

    pub fn cancel(self) { self.task.abort(); }
}

/// Generic stream handle used by streaming endpoints.
pub struct StreamHandle<T> {
    pub rx: tokio::sync::mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}
