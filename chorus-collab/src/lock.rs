//! Cross-process mutual exclusion with TTL-bounded leases.
//!
//! A document's mutation pipeline (read version → rebase → append) must run
//! as a single critical section across every server process. The manager
//! implements the lease pattern over two atomic primitives:
//!
//! - acquire: set-if-absent with a TTL and a random ownership token
//! - release: delete-only-if-token-matches (compare-and-delete)
//!
//! The ownership token prevents a slow holder from releasing a lease that
//! already expired and was re-acquired by someone else. The TTL bounds
//! staleness when a holder crashes without releasing.
//!
//! The storage primitives live behind [`LeaseStore`]; [`MemoryLeaseStore`]
//! serves single-process deployments and tests, and a shared store (Redis,
//! SQL) plugs in behind the same trait for multi-process fleets.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CollabConfig;

/// Build the lease key for a document.
///
/// Namespaced so document locks cannot collide with unrelated keys in a
/// shared lease store.
pub fn document_resource_key(document_id: Uuid) -> String {
    format!("document:{document_id}")
}

/// Atomic lease storage primitives.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically create the lease if absent (or expired). Returns `true`
    /// when this caller now owns the lease.
    async fn try_acquire(&self, key: &str, token: Uuid, ttl: Duration) -> bool;

    /// Atomically delete the lease only if it is still owned by `token`.
    /// Returns `true` when the lease was deleted.
    async fn release_if_owner(&self, key: &str, token: Uuid) -> bool;

    /// Whether a live lease currently exists. Racy by nature.
    async fn is_held(&self, key: &str) -> bool;
}

/// In-process lease store: a single mutex-guarded map with lazy expiry.
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

struct Lease {
    token: Uuid,
    expires_at: Instant,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, token: Uuid, ttl: Duration) -> bool {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        match leases.get(key) {
            Some(lease) if lease.expires_at > now => false,
            _ => {
                leases.insert(
                    key.to_string(),
                    Lease {
                        token,
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    async fn release_if_owner(&self, key: &str, token: Uuid) -> bool {
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some(lease) if lease.token == token => {
                leases.remove(key);
                true
            }
            _ => false,
        }
    }

    async fn is_held(&self, key: &str) -> bool {
        let leases = self.leases.lock().await;
        match leases.get(key) {
            Some(lease) => lease.expires_at > Instant::now(),
            None => false,
        }
    }
}

/// Proof of lease ownership, consumed by [`LockManager::release`].
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: Uuid,
}

impl LockHandle {
    /// The resource key this handle locks.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Lock acquisition errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock stayed held past the acquisition deadline. Retryable: the
    /// lock was never held, no state was touched.
    Timeout { key: String, waited: Duration },
    /// The caller was cancelled while waiting between attempts.
    Cancelled { key: String },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Timeout { key, waited } => {
                write!(f, "Lock on '{key}' timed out after {waited:?}")
            }
            LockError::Cancelled { key } => {
                write!(f, "Lock acquisition on '{key}' cancelled")
            }
        }
    }
}

impl std::error::Error for LockError {}

/// TTL-leased lock manager over a [`LeaseStore`].
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    ttl: Duration,
    retry_interval: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: &CollabConfig) -> Self {
        Self {
            store,
            ttl: config.lock_ttl,
            retry_interval: config.lock_retry_interval,
        }
    }

    /// Acquire the lock, retrying until `timeout` elapses.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockHandle, LockError> {
        self.acquire_cancellable(key, timeout, &CancellationToken::new())
            .await
    }

    /// Acquire the lock, honoring `cancel` at every retry boundary.
    ///
    /// Cancellation wins immediately between attempts; an attempt already
    /// in flight completes first.
    pub async fn acquire_cancellable(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError> {
        let token = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled {
                    key: key.to_string(),
                });
            }

            if self.store.try_acquire(key, token, self.ttl).await {
                log::trace!("Acquired lock '{key}' with token {token}");
                return Ok(LockHandle {
                    key: key.to_string(),
                    token,
                });
            }

            if Instant::now() + self.retry_interval > deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: started.elapsed(),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(LockError::Cancelled { key: key.to_string() });
                }
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Release a held lock.
    ///
    /// Failure is logged, never surfaced: the lease either expired (and may
    /// already belong to someone else — exactly what compare-and-delete
    /// protects against) or the store is unreachable, in which case the TTL
    /// bounds how long the lease lingers.
    pub async fn release(&self, handle: LockHandle) {
        if !self
            .store
            .release_if_owner(&handle.key, handle.token)
            .await
        {
            log::warn!(
                "Release of lock '{}' skipped: lease expired or owned by another holder",
                handle.key
            );
        }
    }

    /// Best-effort check, for diagnostics only — never gate correctness on
    /// this answer.
    pub async fn is_locked(&self, key: &str) -> bool {
        self.store.is_held(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(ttl_ms: u64, retry_ms: u64) -> LockManager {
        let config = CollabConfig {
            lock_ttl: Duration::from_millis(ttl_ms),
            lock_retry_interval: Duration::from_millis(retry_ms),
            ..CollabConfig::for_testing()
        };
        LockManager::new(Arc::new(MemoryLeaseStore::new()), &config)
    }

    #[tokio::test]
    async fn test_acquire_free_lock() {
        let manager = manager_with(1000, 10);
        let handle = manager
            .acquire("document:test", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(handle.key(), "document:test");
        assert!(manager.is_locked("document:test").await);
    }

    #[tokio::test]
    async fn test_release_frees_lock() {
        let manager = manager_with(1000, 10);
        let handle = manager
            .acquire("document:test", Duration::from_millis(100))
            .await
            .unwrap();
        manager.release(handle).await;
        assert!(!manager.is_locked("document:test").await);

        // Re-acquirable immediately.
        manager
            .acquire("document:test", Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let manager = manager_with(5000, 10);
        let _held = manager
            .acquire("document:busy", Duration::from_millis(100))
            .await
            .unwrap();

        let err = manager
            .acquire("document:busy", Duration::from_millis(80))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let store = Arc::new(MemoryLeaseStore::new());
        let config = CollabConfig {
            lock_ttl: Duration::from_secs(5),
            lock_retry_interval: Duration::from_millis(5),
            ..CollabConfig::for_testing()
        };
        let manager = Arc::new(LockManager::new(store, &config));

        let held = manager
            .acquire("document:handoff", Duration::from_millis(100))
            .await
            .unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire("document:handoff", Duration::from_millis(500))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.release(held).await;

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.key(), "document:handoff");
    }

    #[tokio::test]
    async fn test_expired_lease_is_reacquirable() {
        let manager = manager_with(30, 10);
        let _stale = manager
            .acquire("document:ttl", Duration::from_millis(100))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        // TTL elapsed: a new owner may take the lease even though the old
        // handle was never released.
        manager
            .acquire("document:ttl", Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_release_does_not_steal() {
        let store = Arc::new(MemoryLeaseStore::new());
        let config = CollabConfig {
            lock_ttl: Duration::from_millis(30),
            lock_retry_interval: Duration::from_millis(5),
            ..CollabConfig::for_testing()
        };
        let manager = LockManager::new(store.clone(), &config);

        let stale = manager
            .acquire("document:cad", Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fresh = manager
            .acquire("document:cad", Duration::from_millis(100))
            .await
            .unwrap();

        // The stale holder's release must not delete the fresh lease.
        manager.release(stale).await;
        assert!(manager.is_locked("document:cad").await);

        manager.release(fresh).await;
        assert!(!manager.is_locked("document:cad").await);
    }

    #[tokio::test]
    async fn test_cancellation_beats_timeout() {
        let manager = manager_with(5000, 20);
        let _held = manager
            .acquire("document:cancel", Duration::from_millis(100))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager
            .acquire_cancellable("document:cancel", Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_mid_wait() {
        let manager = Arc::new(manager_with(5000, 20));
        let _held = manager
            .acquire("document:midwait", Duration::from_millis(100))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .acquire_cancellable("document:midwait", Duration::from_secs(10), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let manager = manager_with(1000, 10);
        let a = manager
            .acquire("document:a", Duration::from_millis(100))
            .await
            .unwrap();
        let b = manager
            .acquire("document:b", Duration::from_millis(100))
            .await
            .unwrap();
        manager.release(a).await;
        manager.release(b).await;
    }

    #[test]
    fn test_document_resource_key_namespaced() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            document_resource_key(id),
            "document:550e8400-e29b-41d4-a716-446655440000"
        );
    }
}
