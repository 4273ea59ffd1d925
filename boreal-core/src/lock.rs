use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

/// Lease identity handed back by a successful acquire. Release only
/// succeeds while the store still holds this exact value, so a worker can
/// never free a lease that expired and was re-granted to someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// No lease became available within the acquire timeout. Recoverable:
    /// the contended resource may free up, so callers treat this as a
    /// transient condition and retry the whole attempt later.
    #[error("timed out acquiring lock {key} after {waited_ms}ms")]
    Timeout { key: String, waited_ms: u64 },
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        LockError::Backend(err.to_string())
    }
}

/// Mutual exclusion over a named resource shared by worker processes.
///
/// `acquire` must be a single atomic set-if-absent against the shared
/// store: under concurrent callers exactly one wins. Implementations retry
/// with a bounded backoff until `timeout` elapses, never busy-spin. Every
/// lease auto-expires after `lease` even if the holder crashes, bounding
/// starvation to one lease period.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<LockToken, LockError>;

    /// Compare-and-delete. Returns `false` when the lease was no longer
    /// held under this token (already expired or re-granted).
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, LockError>;
}

/// Lock key for a seat, shared by every pipeline worker.
pub fn seat_lock_key(seat_id: Uuid) -> String {
    format!("flight:lock:seat:{}", seat_id)
}
