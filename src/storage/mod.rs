//! # Shared Storage
//!
//! The lockable key-value substrate that holds query status, task states and
//! task records, with one adapter per backend behind a common trait.

pub mod cache;
pub mod memory;
pub mod provider;
#[cfg(feature = "storage-redis")]
pub mod redis;
pub mod traits;

pub use cache::{query_status_key, query_task_key, task_states_key, QueryStorageCache};
pub use memory::InMemoryLockableStore;
pub use provider::StorageProvider;
#[cfg(feature = "storage-redis")]
pub use self::redis::RedisLockableStore;
pub use traits::{LockToken, LockableStore};
