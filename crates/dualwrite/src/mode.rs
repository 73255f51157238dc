//! Mode selector: maps a dual writer mode to a routing policy.

use std::collections::BTreeMap;

use duet_core::{BackendKind, DualWriterMode, ResourceInfo};
use smallvec::{smallvec, SmallVec};

use crate::config::{ConfigError, StorageConfig};

/// How a stale resourceVersion on update is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Stale token -> `Conflict`.
    Strict,
    /// Stale token is logged and the write is applied unconditionally.
    LastWriterWins,
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::Strict => "strict",
            ConflictPolicy::LastWriterWins => "last-writer-wins",
        }
    }
}

/// Where writes and reads go for one resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicy {
    pub mode: DualWriterMode,
    /// Primary first; the primary is always the read target.
    pub write_targets: SmallVec<[BackendKind; 2]>,
    pub read_target: BackendKind,
    pub require_both_succeed: bool,
    pub conflict_policy: ConflictPolicy,
}

impl RoutingPolicy {
    pub fn for_mode(mode: DualWriterMode) -> Self {
        use BackendKind::{Legacy, Unified};
        let (write_targets, read_target, require_both_succeed): (SmallVec<[BackendKind; 2]>, _, _) = match mode {
            DualWriterMode::Mode0 => (smallvec![Legacy], Legacy, false),
            DualWriterMode::Mode1 => (smallvec![Legacy, Unified], Legacy, false),
            DualWriterMode::Mode2 => (smallvec![Legacy, Unified], Legacy, true),
            DualWriterMode::Mode3 => (smallvec![Unified, Legacy], Unified, true),
            DualWriterMode::Mode4 => (smallvec![Unified, Legacy], Unified, false),
            DualWriterMode::Mode5 => (smallvec![Unified], Unified, false),
        };
        let conflict_policy = match read_target {
            Legacy => ConflictPolicy::Strict,
            Unified => ConflictPolicy::LastWriterWins,
        };
        Self { mode, write_targets, read_target, require_both_succeed, conflict_policy }
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn primary(&self) -> BackendKind { self.read_target }

    pub fn shadow(&self) -> Option<BackendKind> { self.write_targets.get(1).copied() }

    pub fn writes_to(&self, kind: BackendKind) -> bool { self.write_targets.contains(&kind) }
}

/// Read-only routing table built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: BTreeMap<String, RoutingPolicy>,
}

impl RoutingTable {
    /// Every served resource needs a configured mode and every configured
    /// resource must be served; anything else is a startup error.
    pub fn build(cfg: &StorageConfig, served: &[ResourceInfo]) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let mut routes = BTreeMap::new();
        for info in served {
            let key = info.group_resource();
            let rc = cfg.resource(&key).ok_or_else(|| ConfigError::MissingResource(key.clone()))?;
            let mut policy = RoutingPolicy::for_mode(rc.mode);
            if rc.strict_conflicts {
                policy = policy.with_conflict_policy(ConflictPolicy::Strict);
            }
            routes.insert(key, policy);
        }
        if let Some(extra) = cfg.resources.keys().find(|k| !routes.contains_key(*k)) {
            return Err(ConfigError::UnknownResource(extra.clone()));
        }
        Ok(Self { routes })
    }

    pub fn policy(&self, resource: &str) -> Option<&RoutingPolicy> { self.routes.get(resource) }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RoutingPolicy)> { self.routes.iter() }

    pub fn len(&self) -> usize { self.routes.len() }

    pub fn is_empty(&self) -> bool { self.routes.is_empty() }
}
