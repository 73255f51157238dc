//! Full-state snapshots of a [`UnifiedStore`], written atomically via rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use duet_core::{GroupVersionResource, Resource};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::{State, UnifiedStore, EVENT_BUFFER};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub revision: u64,
    pub objects: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub gvr: GroupVersionResource,
    pub object: Resource,
}

/// `DUET_SNAPSHOT_PATH`, else `~/.duet/unified.json`.
pub fn default_snapshot_path() -> PathBuf {
    if let Ok(p) = std::env::var("DUET_SNAPSHOT_PATH") {
        return PathBuf::from(p);
    }
    match std::env::var_os("HOME") {
        Some(home) => {
            let mut p = PathBuf::from(home);
            p.push(".duet");
            p.push("unified.json");
            p
        }
        None => PathBuf::from("duet-unified.json"),
    }
}

impl UnifiedStore {
    /// Every stored object, ordered by resource type, namespace and name.
    pub fn snapshot(&self) -> Snapshot {
        let st = self.lock();
        let mut by_gvr: Vec<_> = st.objects.iter().collect();
        by_gvr.sort_by(|a, b| a.0.cmp(b.0));
        let objects = by_gvr
            .into_iter()
            .flat_map(|(gvr, m)| m.values().map(move |o| SnapshotEntry { gvr: gvr.clone(), object: o.clone() }))
            .collect();
        Snapshot { revision: st.revision, objects }
    }

    /// Rebuild a store. The revision resumes after the highest version seen,
    /// so resourceVersions minted later never repeat a restored one.
    pub fn from_snapshot(snap: Snapshot) -> Self {
        let mut state = State { revision: snap.revision, ..Default::default() };
        for SnapshotEntry { gvr, object } in snap.objects {
            if let Ok(rv) = object.resource_version().parse::<u64>() {
                state.revision = state.revision.max(rv);
            }
            state
                .objects
                .entry(gvr)
                .or_insert_with(BTreeMap::new)
                .insert((object.namespace().to_string(), object.name().to_string()), object);
        }
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (revision_tx, revision_rx) = watch::channel(state.revision);
        Self { state: Mutex::new(state), events, revision_tx, revision_rx }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading snapshot {}", path.display()))?;
        let snap: Snapshot =
            serde_json::from_slice(&bytes).with_context(|| format!("decoding snapshot {}", path.display()))?;
        info!(path = %path.display(), objects = snap.objects.len(), revision = snap.revision, "unified: snapshot loaded");
        Ok(Self::from_snapshot(snap))
    }

    /// Load `path` if it exists, else start empty.
    pub fn load_or_new(path: &Path) -> anyhow::Result<Self> {
        if path.exists() { Self::load(path) } else { Ok(Self::new()) }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let snap = self.snapshot();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&snap).context("encoding snapshot")?;
        std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        info!(path = %path.display(), objects = snap.objects.len(), revision = snap.revision, "unified: snapshot saved");
        Ok(())
    }
}
