//! # In-Memory Lockable Store
//!
//! Process-local implementation of [`LockableStore`] for single-instance
//! deployments and tests. Values live in a `DashMap`; locks live in a
//! separate table with lease deadlines and waiters are woken on release.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::traits::{LockToken, LockableStore};
use crate::error::CoordinationResult;

#[derive(Debug)]
struct HeldLock {
    token: Uuid,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: DashMap<String, String>,
    locks: Mutex<HashMap<String, HeldLock>>,
    released: Notify,
}

/// Cloning shares the underlying maps
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockableStore {
    inner: Arc<Inner>,
}

impl InMemoryLockableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Whether `key` is currently locked by an unexpired lease
    pub fn is_locked(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .locks
            .lock()
            .get(key)
            .is_some_and(|held| held.expires_at > now)
    }

    /// Take the lock if it is free or its lease has run out. On contention
    /// returns the current holder's expiry.
    fn acquire(&self, key: &str, lease: Duration) -> Result<LockToken, Instant> {
        let now = Instant::now();
        let mut locks = self.inner.locks.lock();
        match locks.get(key) {
            Some(held) if held.expires_at > now => Err(held.expires_at),
            _ => {
                let token = LockToken::new(key);
                locks.insert(
                    key.to_string(),
                    HeldLock {
                        token: token.token(),
                        expires_at: now + lease,
                    },
                );
                Ok(token)
            }
        }
    }
}

impl LockableStore for InMemoryLockableStore {
    async fn get(&self, key: &str) -> CoordinationResult<Option<String>> {
        Ok(self.inner.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: &str) -> CoordinationResult<()> {
        self.inner.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> CoordinationResult<bool> {
        Ok(self.inner.entries.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> CoordinationResult<Vec<(String, String)>> {
        let mut entries: Vec<(String, String)> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn try_lock(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> CoordinationResult<Option<LockToken>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let holder_expiry = match self.acquire(key, lease) {
                Ok(token) => {
                    debug!(key = key, lease_ms = lease.as_millis() as u64, "🔒 Lock acquired");
                    return Ok(Some(token));
                }
                Err(expiry) => expiry,
            };

            if Instant::now() >= deadline {
                debug!(key = key, wait_ms = wait.as_millis() as u64, "Lock wait timed out");
                return Ok(None);
            }

            // Wake on release, on lease expiry, or at the deadline
            let _ = tokio::time::timeout_at(deadline.min(holder_expiry), notified).await;
        }
    }

    async fn unlock(&self, token: &LockToken) -> CoordinationResult<bool> {
        let now = Instant::now();
        let released = {
            let mut locks = self.inner.locks.lock();
            match locks.get(token.key()) {
                Some(held) if held.token == token.token() => {
                    let still_valid = held.expires_at > now;
                    locks.remove(token.key());
                    still_valid
                }
                _ => false,
            }
        };
        self.inner.released.notify_waiters();
        debug!(key = token.key(), released = released, "🔓 Lock released");
        Ok(released)
    }

    async fn force_unlock(&self, key: &str) -> CoordinationResult<()> {
        self.inner.locks.lock().remove(key);
        self.inner.released.notify_waiters();
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_put_remove_list() {
        let store = InMemoryLockableStore::new();
        store.put("queryStatus:b", "2").await.unwrap();
        store.put("queryStatus:a", "1").await.unwrap();
        store.put("taskStates:a", "x").await.unwrap();

        assert_eq!(store.get("queryStatus:a").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);

        let listed = store.list("queryStatus:").await.unwrap();
        assert_eq!(
            listed,
            vec![
                ("queryStatus:a".to_string(), "1".to_string()),
                ("queryStatus:b".to_string(), "2".to_string())
            ]
        );

        assert!(store.remove("queryStatus:a").await.unwrap());
        assert!(!store.remove("queryStatus:a").await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let store = InMemoryLockableStore::new();
        let lease = Duration::from_secs(30);

        let token = store
            .try_lock("q1", Duration::ZERO, lease)
            .await
            .unwrap()
            .expect("first lock");
        assert!(store.is_locked("q1"));
        assert!(store
            .try_lock("q1", Duration::from_millis(20), lease)
            .await
            .unwrap()
            .is_none());

        // Different keys never contend
        assert!(store.try_lock("q2", Duration::ZERO, lease).await.unwrap().is_some());

        assert!(store.unlock(&token).await.unwrap());
        assert!(store.try_lock("q1", Duration::ZERO, lease).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let store = InMemoryLockableStore::new();
        let lease = Duration::from_secs(30);
        let token = store.try_lock("q", Duration::ZERO, lease).await.unwrap().unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.try_lock("q", Duration::from_secs(5), lease).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.unlock(&token).await.unwrap();

        let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .unwrap()
            .unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_frees_lock() {
        let store = InMemoryLockableStore::new();
        let stale = store
            .try_lock("q", Duration::ZERO, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();

        let token = store
            .try_lock("q", Duration::from_millis(200), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(token.is_some());

        // The stale holder can no longer release the lock it lost
        assert!(!store.unlock(&stale).await.unwrap());
        assert!(store.is_locked("q"));
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let store = InMemoryLockableStore::new();
        store.try_lock("q", Duration::ZERO, Duration::from_secs(30)).await.unwrap();
        store.force_unlock("q").await.unwrap();
        assert!(!store.is_locked("q"));
    }
}
