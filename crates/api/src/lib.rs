//! Duet API façade (in-process).
//!
//! Frontends call [`ResourceStorage`] for one resource type; every call is
//! authorized before any backend is touched and then handed to the
//! resource's [`DualWriter`](duet_dualwrite::DualWriter).

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod authz;
pub mod patch;
mod registry;
mod storage;

pub use authz::{AllowAll, Authorizer, RoleAuthorizer};
pub use registry::{Registry, RegistryBuilder};
pub use storage::ResourceStorage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    None,
    Viewer,
    Editor,
    Admin,
}

/// Caller identity as established by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    /// Home namespace; `None` for cluster-scoped service identities.
    pub namespace: Option<String>,
    pub role: Role,
}

impl Identity {
    pub fn new(subject: &str, namespace: &str, role: Role) -> Self {
        Self { subject: subject.to_string(), namespace: Some(namespace.to_string()), role }
    }

    pub fn cluster(subject: &str, role: Role) -> Self {
        Self { subject: subject.to_string(), namespace: None, role }
    }
}

/// What a request wants to touch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceIdentity {
    /// `resource.group`
    pub resource: String,
    /// `None` for cluster-wide list/watch.
    pub namespace: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool { matches!(self, Decision::Allow) }
}
