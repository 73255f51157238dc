//! Optimistic-concurrency check against the authoritative backend.

use duet_core::{Resource, StorageError, StorageResult};
use metrics::counter;
use tracing::warn;

use crate::mode::ConflictPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Caller sent no resourceVersion.
    Unconditional,
    Current,
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    policy: ConflictPolicy,
}

impl ConflictDetector {
    pub fn new(policy: ConflictPolicy) -> Self { Self { policy } }

    pub fn policy(&self) -> ConflictPolicy { self.policy }

    /// Opaque token comparison; no ordering is assumed.
    pub fn check(expected: Option<&str>, current: &str) -> Verdict {
        match expected {
            None | Some("") => Verdict::Unconditional,
            Some(e) if e == current => Verdict::Current,
            Some(_) => Verdict::Stale,
        }
    }

    /// Returns the version to pass down as the backend's compare-and-swap
    /// precondition, or `None` for an unconditional write.
    pub fn evaluate(
        &self,
        resource: &str,
        expected: Option<&str>,
        current: &Resource,
    ) -> StorageResult<Option<String>> {
        let cur = current.resource_version();
        match Self::check(expected, cur) {
            Verdict::Unconditional => Ok(None),
            Verdict::Current => Ok(Some(cur.to_string())),
            Verdict::Stale => {
                let exp = expected.unwrap_or_default();
                counter!("dualwriter_conflict_total", 1u64, "resource" => resource.to_string(), "policy" => self.policy.as_str());
                match self.policy {
                    ConflictPolicy::Strict => Err(StorageError::conflict(resource, current.name(), exp, cur)),
                    ConflictPolicy::LastWriterWins => {
                        warn!(resource, name = %current.name(), expected = %exp, current = %cur, "dualwriter: stale resourceVersion accepted (last writer wins)");
                        Ok(None)
                    }
                }
            }
        }
    }
}
