//! # Locked Cache Update
//!
//! Read-modify-write of a shared record under its distributed lock:
//!
//! 1. `try_lock(key, wait, lease)`
//! 2. read the record, failing with `NotFound` if it is absent
//! 3. apply the caller's mutation
//! 4. write the record back
//! 5. release the lock, whatever happened in 2-4
//!
//! If the lock cannot be acquired the updater's `on_lock_failed` hook decides
//! the outcome; by default that is a `LockTimeout` error.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::storage::QueryStorageCache;

/// Mutation applied to a record while its lock is held
#[async_trait]
pub trait CacheUpdater<T: Send>: Send {
    async fn apply(&mut self, entry: &mut T) -> CoordinationResult<()>;

    /// Called when the lock could not be acquired within `wait`
    fn on_lock_failed(&mut self, key: &str, wait: Duration) -> CoordinationResult<()> {
        Err(CoordinationError::lock_timeout(key, wait.as_millis() as u64))
    }
}

/// Adapts a synchronous closure into a [`CacheUpdater`]
pub struct SyncUpdate<T, F> {
    update: F,
    _entry: PhantomData<fn(&mut T)>,
}

impl<T, F> SyncUpdate<T, F>
where
    F: FnMut(&mut T) -> CoordinationResult<()> + Send,
{
    pub fn new(update: F) -> Self {
        Self {
            update,
            _entry: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> CacheUpdater<T> for SyncUpdate<T, F>
where
    T: Send,
    F: FnMut(&mut T) -> CoordinationResult<()> + Send,
{
    async fn apply(&mut self, entry: &mut T) -> CoordinationResult<()> {
        (self.update)(entry)
    }
}

/// Wraps an updater so lock contention is logged and skipped instead of
/// failing. For non-critical updates such as liveness refreshes.
pub struct Lenient<U>(pub U);

#[async_trait]
impl<T: Send, U: CacheUpdater<T>> CacheUpdater<T> for Lenient<U> {
    async fn apply(&mut self, entry: &mut T) -> CoordinationResult<()> {
        self.0.apply(entry).await
    }

    fn on_lock_failed(&mut self, key: &str, wait: Duration) -> CoordinationResult<()> {
        warn!(key = key, wait_ms = wait.as_millis() as u64, "Skipping update, lock unavailable");
        Ok(())
    }
}

/// Runs [`CacheUpdater`]s against records of a [`QueryStorageCache`]
#[derive(Debug, Clone)]
pub struct LockedCacheUpdate {
    cache: Arc<QueryStorageCache>,
    wait_time: Duration,
    lease_time: Duration,
}

impl LockedCacheUpdate {
    pub fn new(cache: Arc<QueryStorageCache>, lock: &LockConfig) -> Self {
        Self {
            cache,
            wait_time: lock.wait_time(),
            lease_time: lock.lease_time(),
        }
    }

    pub fn cache(&self) -> &Arc<QueryStorageCache> {
        &self.cache
    }

    /// Apply `updater` to the record at `key`.
    ///
    /// Returns the written record, or `Ok(None)` when the lock was not
    /// acquired and `on_lock_failed` chose not to fail. A failing mutation
    /// leaves the stored record untouched.
    pub async fn update<T, U>(&self, entity: &str, key: &str, updater: &mut U) -> CoordinationResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        U: CacheUpdater<T> + ?Sized,
    {
        let Some(token) = self.cache.try_lock(key, self.wait_time, self.lease_time).await? else {
            updater.on_lock_failed(key, self.wait_time)?;
            return Ok(None);
        };

        let outcome = async {
            let mut entry: T = self
                .cache
                .get_record(key)
                .await?
                .ok_or_else(|| CoordinationError::not_found(entity, key))?;
            updater.apply(&mut entry).await?;
            self.cache.put_record(key, &entry).await?;
            Ok::<T, CoordinationError>(entry)
        }
        .await;

        match self.cache.unlock(&token).await {
            Ok(true) => {}
            Ok(false) => warn!(key = key, "Lock lease expired before release"),
            Err(e) => warn!(key = key, error = %e, "Failed to release lock"),
        }

        if let Err(e) = &outcome {
            debug!(key = key, entity = entity, error = %e, "Locked update failed");
        }
        outcome.map(Some)
    }
}
