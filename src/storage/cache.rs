//! Typed query storage
//!
//! JSON records over a [`StorageProvider`], keyed per query id:
//!
//! | record | key |
//! |---|---|
//! | [`QueryStatus`] | `queryStatus:{query_id}` |
//! | [`TaskStates`] | `taskStates:{query_id}` |
//! | [`QueryTask`] | `queryTask:{query_id}:{task_id}` |

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::provider::StorageProvider;
use super::traits::{LockToken, LockableStore};
use crate::constants::{QUERY_STATUS_CACHE, QUERY_TASK_CACHE, TASK_STATES_CACHE};
use crate::error::{CoordinationError, CoordinationResult};
use crate::models::{QueryStatus, QueryTask, TaskId, TaskKey};
use crate::state_machine::TaskStates;

pub fn query_status_key(query_id: &Uuid) -> String {
    format!("{QUERY_STATUS_CACHE}:{query_id}")
}

pub fn task_states_key(query_id: &Uuid) -> String {
    format!("{TASK_STATES_CACHE}:{query_id}")
}

pub fn query_task_key(query_id: &Uuid, task_id: TaskId) -> String {
    format!("{QUERY_TASK_CACHE}:{query_id}:{task_id}")
}

#[derive(Debug, Clone)]
pub struct QueryStorageCache {
    store: StorageProvider,
}

impl QueryStorageCache {
    pub fn new(store: StorageProvider) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(StorageProvider::new_in_memory())
    }

    pub fn store(&self) -> &StorageProvider {
        &self.store
    }

    /// Read and decode a record
    pub async fn get_record<T: DeserializeOwned>(&self, key: &str) -> CoordinationResult<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CoordinationError::serialization(key, e.to_string())),
            None => Ok(None),
        }
    }

    /// Encode and write a record
    pub async fn put_record<T: Serialize>(&self, key: &str, record: &T) -> CoordinationResult<()> {
        let raw = serde_json::to_string(record)
            .map_err(|e| CoordinationError::serialization(key, e.to_string()))?;
        self.store.put(key, &raw).await
    }

    pub async fn remove_record(&self, key: &str) -> CoordinationResult<bool> {
        self.store.remove(key).await
    }

    pub async fn try_lock(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> CoordinationResult<Option<LockToken>> {
        self.store.try_lock(key, wait, lease).await
    }

    pub async fn unlock(&self, token: &LockToken) -> CoordinationResult<bool> {
        self.store.unlock(token).await
    }

    // Query status

    pub async fn query_status(&self, query_id: &Uuid) -> CoordinationResult<Option<QueryStatus>> {
        self.get_record(&query_status_key(query_id)).await
    }

    pub async fn put_query_status(&self, status: &QueryStatus) -> CoordinationResult<()> {
        self.put_record(&query_status_key(&status.query_key.query_id), status)
            .await
    }

    pub async fn remove_query_status(&self, query_id: &Uuid) -> CoordinationResult<bool> {
        self.remove_record(&query_status_key(query_id)).await
    }

    /// Every stored query status. Undecodable records are skipped with a warning.
    pub async fn list_query_statuses(&self) -> CoordinationResult<Vec<QueryStatus>> {
        let prefix = format!("{QUERY_STATUS_CACHE}:");
        let entries = self.store.list(&prefix).await?;
        let mut statuses = Vec::with_capacity(entries.len());
        for (key, raw) in entries {
            match serde_json::from_str::<QueryStatus>(&raw) {
                Ok(status) => statuses.push(status),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable query status"),
            }
        }
        Ok(statuses)
    }

    // Task states

    pub async fn task_states(&self, query_id: &Uuid) -> CoordinationResult<Option<TaskStates>> {
        self.get_record(&task_states_key(query_id)).await
    }

    pub async fn put_task_states(&self, states: &TaskStates) -> CoordinationResult<()> {
        self.put_record(&task_states_key(&states.query_key.query_id), states)
            .await
    }

    pub async fn remove_task_states(&self, query_id: &Uuid) -> CoordinationResult<bool> {
        self.remove_record(&task_states_key(query_id)).await
    }

    // Tasks

    pub async fn task(&self, task_key: &TaskKey) -> CoordinationResult<Option<QueryTask>> {
        self.task_by_id(&task_key.query_id(), task_key.task_id).await
    }

    pub async fn task_by_id(
        &self,
        query_id: &Uuid,
        task_id: TaskId,
    ) -> CoordinationResult<Option<QueryTask>> {
        self.get_record(&query_task_key(query_id, task_id)).await
    }

    pub async fn put_task(&self, task: &QueryTask) -> CoordinationResult<()> {
        self.put_record(&query_task_key(&task.task_key.query_id(), task.task_id()), task)
            .await
    }

    pub async fn remove_task(&self, task_key: &TaskKey) -> CoordinationResult<bool> {
        self.remove_record(&query_task_key(&task_key.query_id(), task_key.task_id))
            .await
    }

    /// Remove every task record of a query, returning how many were removed
    pub async fn remove_tasks(&self, query_id: &Uuid) -> CoordinationResult<usize> {
        let prefix = format!("{QUERY_TASK_CACHE}:{query_id}:");
        let entries = self.store.list(&prefix).await?;
        let mut removed = 0;
        for (key, _) in entries {
            if self.store.remove(&key).await? {
                removed += 1;
            }
        }
        debug!(query_id = %query_id, removed = removed, "Removed query tasks");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueryCheckpoint, QueryKey, QueryState, TaskAction};
    use crate::state_machine::TaskState;

    fn query_key() -> QueryKey {
        QueryKey::new("default", Uuid::new_v4(), "EventQuery")
    }

    #[tokio::test]
    async fn test_query_status_round_trip() {
        let cache = QueryStorageCache::in_memory();
        let mut status = QueryStatus::new(query_key(), "alice", 1);
        status.query_state = QueryState::Create;
        let query_id = status.query_key.query_id;

        cache.put_query_status(&status).await.unwrap();
        assert_eq!(cache.query_status(&query_id).await.unwrap(), Some(status));
        assert_eq!(cache.list_query_statuses().await.unwrap().len(), 1);

        assert!(cache.remove_query_status(&query_id).await.unwrap());
        assert_eq!(cache.query_status(&query_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_task_states_stored_with_compact_id_lists() {
        let cache = QueryStorageCache::in_memory();
        let key = query_key();
        let mut states = TaskStates::new(key.clone(), 2);
        for id in [2, 5, 9] {
            states.set_state(id, Some(TaskState::Ready));
        }
        states.set_state(1, Some(TaskState::Running));
        cache.put_task_states(&states).await.unwrap();

        let raw = cache
            .store()
            .get(&task_states_key(&key.query_id))
            .await
            .unwrap()
            .unwrap();
        assert!(raw.contains("\"ready\":\"2,5,9\""));
        assert_eq!(cache.task_states(&key.query_id).await.unwrap(), Some(states));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_serialization_failure() {
        let cache = QueryStorageCache::in_memory();
        let query_id = Uuid::new_v4();
        cache
            .store()
            .put(&query_status_key(&query_id), "{not json")
            .await
            .unwrap();

        let err = cache.query_status(&query_id).await.unwrap_err();
        assert!(matches!(err, CoordinationError::SerializationFailure { .. }));
        assert!(err.is_fatal());
        // listing skips it
        assert!(cache.list_query_statuses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_tasks_only_touches_one_query() {
        let cache = QueryStorageCache::in_memory();
        let a = query_key();
        let b = query_key();
        for id in 1..=3 {
            cache
                .put_task(&QueryTask::new(id, TaskAction::Next, QueryCheckpoint::new(a.clone())))
                .await
                .unwrap();
        }
        let other = QueryTask::new(1, TaskAction::Create, QueryCheckpoint::new(b.clone()));
        cache.put_task(&other).await.unwrap();

        assert_eq!(cache.remove_tasks(&a.query_id).await.unwrap(), 3);
        assert!(cache.task(&other.task_key).await.unwrap().is_some());
        assert!(cache.task_by_id(&a.query_id, 1).await.unwrap().is_none());
    }
}
