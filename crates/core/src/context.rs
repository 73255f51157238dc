//! Per-request deadline and cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{StorageError, StorageResult};

/// Caller-supplied deadline and cancellation signal carried through every backend call.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self { Self::default() }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { deadline: Some(Instant::now() + timeout), cancel: CancellationToken::new() }
    }

    /// Child context: cancelled with its parent, optionally with a tighter deadline.
    pub fn child(&self, limit: Option<Duration>) -> Self {
        let limit_deadline = limit.map(|d| Instant::now() + d);
        let deadline = match (self.deadline, limit_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self { deadline, cancel: self.cancel.child_token() }
    }

    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    pub fn cancel(&self) { self.cancel.cancel() }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Check the context before starting work.
    pub fn check(&self) -> StorageResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(StorageError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Drive `fut` until it finishes, the context is cancelled, or the deadline passes.
    pub async fn run<T, F>(&self, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => tokio::select! {
                res = fut => res,
                _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(StorageError::DeadlineExceeded),
            },
            None => tokio::select! {
                res = fut => res,
                _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            },
        }
    }
}
