use duet_core::Verb;

use crate::{Decision, Identity, ResourceIdentity, Role};

/// Authorization collaborator consulted before any backend call.
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_perform(&self, identity: &Identity, verb: Verb, target: &ResourceIdentity) -> Decision;
}

/// Allows everything. For tooling and tests.
pub struct AllowAll;

#[async_trait::async_trait]
impl Authorizer for AllowAll {
    async fn can_perform(&self, _identity: &Identity, _verb: Verb, _target: &ResourceIdentity) -> Decision {
        Decision::Allow
    }
}

/// Namespace-bound role check: viewers read, editors and admins also write.
/// Cluster-scoped identities must be admins.
#[derive(Debug, Clone, Default)]
pub struct RoleAuthorizer;

impl RoleAuthorizer {
    pub fn new() -> Self { Self }

    pub fn decide(identity: &Identity, verb: Verb, target: &ResourceIdentity) -> Decision {
        if identity.role == Role::None {
            return Decision::Deny("no role granted".into());
        }
        match &identity.namespace {
            Some(home) => {
                if target.namespace.as_deref() != Some(home.as_str()) {
                    return Decision::Deny(format!("{} may only access namespace {}", identity.subject, home));
                }
            }
            None => {
                if identity.role != Role::Admin {
                    return Decision::Deny("cluster-scoped access requires the admin role".into());
                }
            }
        }
        let needed = if verb.is_read() { Role::Viewer } else { Role::Editor };
        if identity.role < needed {
            return Decision::Deny(format!("role {:?} cannot {}", identity.role, verb));
        }
        Decision::Allow
    }
}

#[async_trait::async_trait]
impl Authorizer for RoleAuthorizer {
    async fn can_perform(&self, identity: &Identity, verb: Verb, target: &ResourceIdentity) -> Decision {
        Self::decide(identity, verb, target)
    }
}
