//! Lockable key-value storage trait

use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::error::CoordinationResult;

/// Proof of a held advisory lock. Only the holder of the token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    token: Uuid,
}

impl LockToken {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn token(&self) -> Uuid {
        self.token
    }
}

/// Shared key-value storage with per-key advisory locks.
///
/// Locks carry a lease: a lock that is never released becomes available
/// again once its lease elapses, so a crashed holder cannot block a key
/// forever.
pub trait LockableStore: Send + Sync {
    /// Read a value. `Ok(None)` when the key is absent.
    fn get(&self, key: &str)
        -> impl Future<Output = CoordinationResult<Option<String>>> + Send;

    /// Write a value, replacing any existing one
    fn put(&self, key: &str, value: &str) -> impl Future<Output = CoordinationResult<()>> + Send;

    /// Remove a value. Returns whether it existed.
    fn remove(&self, key: &str) -> impl Future<Output = CoordinationResult<bool>> + Send;

    /// Every entry whose key starts with `prefix`
    fn list(
        &self,
        prefix: &str,
    ) -> impl Future<Output = CoordinationResult<Vec<(String, String)>>> + Send;

    /// Try to acquire the lock on `key`, blocking up to `wait`. `Ok(None)` on
    /// timeout.
    fn try_lock(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> impl Future<Output = CoordinationResult<Option<LockToken>>> + Send;

    /// Release a held lock. Returns false if the lease had already expired or
    /// the lock was taken over.
    fn unlock(&self, token: &LockToken) -> impl Future<Output = CoordinationResult<bool>> + Send;

    /// Release a lock regardless of holder
    fn force_unlock(&self, key: &str) -> impl Future<Output = CoordinationResult<()>> + Send;

    fn provider_name(&self) -> &'static str;
}
