//! Storage provider
//!
//! Enum dispatch over the configured [`LockableStore`] backend, selected
//! explicitly from [`StorageConfig`].

use std::time::Duration;
use tracing::info;

use super::memory::InMemoryLockableStore;
#[cfg(feature = "storage-redis")]
use super::redis::RedisLockableStore;
use super::traits::{LockToken, LockableStore};
use crate::config::{StorageBackend, StorageConfig};
use crate::error::{CoordinationError, CoordinationResult};

#[derive(Debug, Clone)]
pub enum StorageProvider {
    InMemory(InMemoryLockableStore),
    #[cfg(feature = "storage-redis")]
    Redis(Box<RedisLockableStore>),
}

impl StorageProvider {
    pub fn new_in_memory() -> Self {
        Self::InMemory(InMemoryLockableStore::new())
    }

    pub async fn from_config(config: &StorageConfig) -> CoordinationResult<Self> {
        let provider = match config.backend {
            StorageBackend::InMemory => Self::new_in_memory(),
            #[cfg(feature = "storage-redis")]
            StorageBackend::Redis => {
                let url = config.redis_url.as_deref().ok_or_else(|| {
                    CoordinationError::configuration("storage.redis_url", "redis backend requires a url")
                })?;
                Self::Redis(Box::new(RedisLockableStore::connect(url).await?))
            }
            #[cfg(not(feature = "storage-redis"))]
            StorageBackend::Redis => {
                return Err(CoordinationError::configuration(
                    "storage.backend",
                    "redis storage requires the `storage-redis` feature",
                ))
            }
        };
        info!(provider = provider.provider_name(), "🗄️ Storage provider initialized");
        Ok(provider)
    }
}

impl LockableStore for StorageProvider {
    async fn get(&self, key: &str) -> CoordinationResult<Option<String>> {
        match self {
            Self::InMemory(s) => s.get(key).await,
            #[cfg(feature = "storage-redis")]
            Self::Redis(s) => s.get(key).await,
        }
    }

    async fn put(&self, key: &str, value: &str) -> CoordinationResult<()> {
        match self {
            Self::InMemory(s) => s.put(key, value).await,
            #[cfg(feature = "storage-redis")]
            Self::Redis(s) => s.put(key, value).await,
        }
    }

    async fn remove(&self, key: &str) -> CoordinationResult<bool> {
        match self {
            Self::InMemory(s) => s.remove(key).await,
            #[cfg(feature = "storage-redis")]
            Self::Redis(s) => s.remove(key).await,
        }
    }

    async fn list(&self, prefix: &str) -> CoordinationResult<Vec<(String, String)>> {
        match self {
            Self::InMemory(s) => s.list(prefix).await,
            #[cfg(feature = "storage-redis")]
            Self::Redis(s) => s.list(prefix).await,
        }
    }

    async fn try_lock(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> CoordinationResult<Option<LockToken>> {
        match self {
            Self::InMemory(s) => s.try_lock(key, wait, lease).await,
            #[cfg(feature = "storage-redis")]
            Self::Redis(s) => s.try_lock(key, wait, lease).await,
        }
    }

    async fn unlock(&self, token: &LockToken) -> CoordinationResult<bool> {
        match self {
            Self::InMemory(s) => s.unlock(token).await,
            #[cfg(feature = "storage-redis")]
            Self::Redis(s) => s.unlock(token).await,
        }
    }

    async fn force_unlock(&self, key: &str) -> CoordinationResult<()> {
        match self {
            Self::InMemory(s) => s.force_unlock(key).await,
            #[cfg(feature = "storage-redis")]
            Self::Redis(s) => s.force_unlock(key).await,
        }
    }

    fn provider_name(&self) -> &'static str {
        match self {
            Self::InMemory(s) => s.provider_name(),
            #[cfg(feature = "storage-redis")]
            Self::Redis(s) => s.provider_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config_is_in_memory() {
        let provider = StorageProvider::from_config(&StorageConfig::default()).await.unwrap();
        assert_eq!(provider.provider_name(), "in_memory");
    }

    #[cfg(not(feature = "storage-redis"))]
    #[tokio::test]
    async fn test_redis_without_feature_is_configuration_error() {
        let config = StorageConfig {
            backend: StorageBackend::Redis,
            redis_url: Some("redis://localhost:6379".to_string()),
        };
        let err = StorageProvider::from_config(&config).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
