//! Copy one object's authoritative state into another backend.

use duet_core::{Backend, Resource, StorageResult};

/// What [`replicate`] had to do on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaAction {
    Created,
    Updated,
    Unchanged,
    /// Same name, different uid: deleted and created again.
    Recreated,
}

impl ReplicaAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicaAction::Created => "created",
            ReplicaAction::Updated => "updated",
            ReplicaAction::Unchanged => "unchanged",
            ReplicaAction::Recreated => "recreated",
        }
    }
}

fn same_content(a: &Resource, b: &Resource) -> bool {
    a.spec == b.spec && a.metadata.labels == b.metadata.labels && a.metadata.annotations == b.metadata.annotations
}

/// Seed for a create on the target: identity, uid and timestamp from the
/// source; backend-local resourceVersion is dropped.
fn seed(source: &Resource) -> Resource {
    let mut obj = source.clone();
    obj.metadata.resource_version.clear();
    obj.metadata.generate_name = None;
    obj
}

/// Upsert `source` into `target`, preserving uid and spec.
///
/// Idempotent: replaying the same source twice leaves the target unchanged.
pub async fn replicate(target: &dyn Backend, source: &Resource) -> StorageResult<ReplicaAction> {
    match target.get(source.namespace(), source.name()).await {
        Ok(existing) if existing.uid() == source.uid() => {
            if same_content(&existing, source) {
                return Ok(ReplicaAction::Unchanged);
            }
            target.update(seed(source), None).await?;
            Ok(ReplicaAction::Updated)
        }
        Ok(_) => {
            target.delete(source.namespace(), source.name()).await?;
            target.create(seed(source)).await?;
            Ok(ReplicaAction::Recreated)
        }
        Err(e) if e.is_not_found() => {
            target.create(seed(source)).await?;
            Ok(ReplicaAction::Created)
        }
        Err(e) => Err(e),
    }
}
