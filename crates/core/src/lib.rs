//! Duet core types: resource envelopes, identities and the backend contract.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod context;
pub mod error;
pub mod list;
pub mod names;
pub mod selector;
pub mod watch;

pub use context::RequestContext;
pub use error::{StorageError, StorageResult};
pub use list::{ContinueToken, ListOptions, ListPage};
pub use selector::{FieldSelector, LabelSelector};
pub use watch::{CancelHandle, StreamHandle, WatchEvent, WatchOptions};

/// Group/version/resource triple addressing a resource type in the unified store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    /// Parse `group/version/resource` or `version/resource` (core group).
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, resource] if !version.is_empty() && !resource.is_empty() => {
                Some(Self::new("", *version, *resource))
            }
            [group, version, resource] if !version.is_empty() && !resource.is_empty() => {
                Some(Self::new(*group, *version, *resource))
            }
            _ => None,
        }
    }

    /// `resource.group`, the form used to key storage configuration.
    pub fn group_resource(&self) -> String {
        if self.group.is_empty() { self.resource.clone() } else { format!("{}.{}", self.resource, self.group) }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Static description of one resource type served through the dual writer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceInfo {
    pub gvr: GroupVersionResource,
    /// Kind written into envelopes (e.g. `ShortURL`).
    pub kind: String,
    /// Kind column used by the legacy relational store (e.g. `short_url`).
    pub legacy_kind: String,
}

impl ResourceInfo {
    pub fn new(gvr: GroupVersionResource, kind: impl Into<String>, legacy_kind: impl Into<String>) -> Self {
        Self { gvr, kind: kind.into(), legacy_kind: legacy_kind.into() }
    }

    pub fn group_resource(&self) -> String { self.gvr.group_resource() }
}

/// Which storage engine a call is routed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Legacy,
    Unified,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Legacy => "legacy",
            BackendKind::Unified => "unified",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// API verbs, as seen by authorization and telemetry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    Patch,
    Delete,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
        }
    }

    pub fn is_read(self) -> bool { matches!(self, Verb::Get | Verb::List | Verb::Watch) }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Routing stage of a resource type during the legacy -> unified migration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum DualWriterMode {
    Mode0,
    Mode1,
    Mode2,
    Mode3,
    Mode4,
    Mode5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown dual writer mode {0} (expected 0-5)")]
pub struct UnknownMode(pub u8);

impl DualWriterMode {
    pub const ALL: [DualWriterMode; 6] = [
        DualWriterMode::Mode0,
        DualWriterMode::Mode1,
        DualWriterMode::Mode2,
        DualWriterMode::Mode3,
        DualWriterMode::Mode4,
        DualWriterMode::Mode5,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            DualWriterMode::Mode0 => 0,
            DualWriterMode::Mode1 => 1,
            DualWriterMode::Mode2 => 2,
            DualWriterMode::Mode3 => 3,
            DualWriterMode::Mode4 => 4,
            DualWriterMode::Mode5 => 5,
        }
    }

    /// Next stage of the migration, if any.
    pub fn next(self) -> Option<Self> { Self::try_from(self.as_u8() + 1).ok() }
}

impl TryFrom<u8> for DualWriterMode {
    type Error = UnknownMode;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(DualWriterMode::Mode0),
            1 => Ok(DualWriterMode::Mode1),
            2 => Ok(DualWriterMode::Mode2),
            3 => Ok(DualWriterMode::Mode3),
            4 => Ok(DualWriterMode::Mode4),
            5 => Ok(DualWriterMode::Mode5),
            other => Err(UnknownMode(other)),
        }
    }
}

impl From<DualWriterMode> for u8 {
    fn from(m: DualWriterMode) -> u8 { m.as_u8() }
}

impl fmt::Display for DualWriterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.as_u8()) }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default)]
    pub namespace: String,
    /// Assigned once at creation; never reused.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Opaque optimistic-concurrency token; advances on every write.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    /// Starts at 1 and advances only when `spec` changes.
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Stored object envelope shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl Resource {
    pub fn new(info: &ResourceInfo, namespace: &str, name: &str, spec: serde_json::Value) -> Self {
        Self {
            api_version: info.gvr.api_version(),
            kind: info.kind.clone(),
            metadata: ObjectMeta { name: name.to_string(), namespace: namespace.to_string(), ..Default::default() },
            spec,
        }
    }

    pub fn with_generate_name(info: &ResourceInfo, namespace: &str, prefix: &str, spec: serde_json::Value) -> Self {
        let mut obj = Self::new(info, namespace, "", spec);
        obj.metadata.generate_name = Some(prefix.to_string());
        obj
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn name(&self) -> &str { &self.metadata.name }
    pub fn namespace(&self) -> &str { &self.metadata.namespace }
    pub fn uid(&self) -> &str { &self.metadata.uid }
    pub fn resource_version(&self) -> &str { &self.metadata.resource_version }
    pub fn generation(&self) -> i64 { self.metadata.generation }

    pub fn spec_field(&self, key: &str) -> Option<&serde_json::Value> { self.spec.get(key) }

    /// Copy the caller-owned parts (spec, labels, annotations) onto `self`,
    /// advancing generation when `spec` differs. Server-owned metadata is kept.
    pub fn apply_user_fields(&mut self, from: &Resource) -> bool {
        let spec_changed = self.spec != from.spec;
        if spec_changed {
            self.spec = from.spec.clone();
            self.metadata.generation += 1;
        }
        self.metadata.labels = from.metadata.labels.clone();
        self.metadata.annotations = from.metadata.annotations.clone();
        spec_changed
    }
}

/// Uniform storage contract implemented by every backend adapter.
///
/// An adapter serves exactly one resource type. Implementations must be safe
/// for concurrent use; atomicity of the version check and write in `update`
/// is the backend's responsibility.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn resource(&self) -> &ResourceInfo;

    /// Store a new object. Assigns the name when only `generateName` is set,
    /// keeps a caller-supplied uid and otherwise mints one.
    async fn create(&self, obj: Resource) -> StorageResult<Resource>;

    async fn get(&self, namespace: &str, name: &str) -> StorageResult<Resource>;

    async fn list(&self, opts: &ListOptions) -> StorageResult<ListPage>;

    /// Replace spec/labels/annotations. With `expected_rv` set, the write only
    /// happens if it equals the stored resourceVersion.
    async fn update(&self, obj: Resource, expected_rv: Option<&str>) -> StorageResult<Resource>;

    /// Idempotent: returns `Ok(false)` when nothing was stored under the name.
    async fn delete(&self, namespace: &str, name: &str) -> StorageResult<bool>;

    async fn watch(&self, _opts: WatchOptions) -> StorageResult<StreamHandle<WatchEvent>> {
        Err(StorageError::BadRequest(format!("watch is not supported by the {} backend", self.kind())))
    }
}
