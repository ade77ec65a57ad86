//! # Query Lifecycle Coordinator
//!
//! Entry point for the query lifecycle: creating queries and tasks, moving
//! tasks between states, admitting next calls and closing, cancelling or
//! removing queries. All shared records are mutated through
//! [`LockedCacheUpdate`], keyed per query id, so different queries never
//! contend.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::admission::{AdmitReadyTask, ClaimNextCall, ReleaseNextCall, TaskAdmission};
use super::locked_update::{CacheUpdater, Lenient, LockedCacheUpdate, SyncUpdate};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::logging::{log_query_operation, log_task_operation};
use crate::messaging::{MessagingProvider, QueryResultsManager};
use crate::models::{
    QueryCheckpoint, QueryState, QueryStatus, QueryTask, TaskAction, TaskDescription, TaskId, TaskKey,
};
use crate::state_machine::{TaskState, TaskStates};
use crate::storage::{
    query_status_key, query_task_key, task_states_key, LockableStore, QueryStorageCache, StorageProvider,
};

const QUERY_STATUS: &str = "query status";
const TASK_STATES: &str = "task states";

/// Allocates a task id and stores the new task as READY
struct CreateTask<'a> {
    cache: &'a QueryStorageCache,
    action: TaskAction,
    checkpoint: Option<QueryCheckpoint>,
    created: Option<QueryTask>,
}

#[async_trait]
impl<'a> CacheUpdater<TaskStates> for CreateTask<'a> {
    async fn apply(&mut self, states: &mut TaskStates) -> CoordinationResult<()> {
        let checkpoint = self
            .checkpoint
            .take()
            .ok_or_else(|| CoordinationError::internal("task already created"))?;
        if checkpoint.query_key != states.query_key {
            return Err(CoordinationError::internal(format!(
                "checkpoint for {} does not belong to {}",
                checkpoint.query_key, states.query_key
            )));
        }

        let task = QueryTask::new(states.new_task_id()?, self.action, checkpoint);
        self.cache.put_task(&task).await?;
        states.set_state(task.task_id(), Some(TaskState::Ready));
        self.created = Some(task);
        Ok(())
    }
}

pub struct QueryCoordinator {
    cache: Arc<QueryStorageCache>,
    locked: LockedCacheUpdate,
    results: Arc<dyn QueryResultsManager>,
    max_running: u32,
    max_concurrent_next_calls: u32,
}

impl std::fmt::Debug for QueryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCoordinator")
            .field("storage", &self.cache.store().provider_name())
            .field("results", &self.results.backend_name())
            .field("max_running", &self.max_running)
            .field("max_concurrent_next_calls", &self.max_concurrent_next_calls)
            .finish()
    }
}

impl QueryCoordinator {
    pub fn new(
        cache: Arc<QueryStorageCache>,
        results: Arc<dyn QueryResultsManager>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            locked: LockedCacheUpdate::new(cache.clone(), &config.lock),
            cache,
            results,
            max_running: config.tasks.max_running,
            max_concurrent_next_calls: config.next_call.concurrency,
        }
    }

    /// Build storage and messaging from configuration
    pub async fn from_config(config: &CoordinatorConfig) -> CoordinationResult<Self> {
        config.validate()?;
        let store = StorageProvider::from_config(&config.storage).await?;
        let results = Arc::new(MessagingProvider::connect(&config.messaging).await?);
        let coordinator = Self::new(Arc::new(QueryStorageCache::new(store)), results, config);
        info!(coordinator = ?coordinator, "🚀 Query coordinator ready");
        Ok(coordinator)
    }

    pub fn cache(&self) -> &Arc<QueryStorageCache> {
        &self.cache
    }

    pub fn results(&self) -> &Arc<dyn QueryResultsManager> {
        &self.results
    }

    pub fn create_id(&self) -> Uuid {
        Uuid::new_v4()
    }

    // Queries

    /// Register a new query in `Create` state and submit its CREATE task
    pub async fn create_query(
        &self,
        checkpoint: QueryCheckpoint,
        owning_principal: &str,
    ) -> CoordinationResult<QueryTask> {
        let query_key = checkpoint.query_key.clone();
        let query_id = query_key.query_id;
        if let Some(existing) = self.cache.query_status(&query_id).await? {
            return Err(CoordinationError::invalid_state(
                query_id.to_string(),
                existing.query_state.to_string(),
                "create_query",
            ));
        }

        let mut status = QueryStatus::new(query_key.clone(), owning_principal, self.max_concurrent_next_calls);
        status.query_state = QueryState::Create;
        self.cache.put_query_status(&status).await?;
        self.cache
            .put_task_states(&TaskStates::new(query_key, self.max_running))
            .await?;

        let task = self.create_task(TaskAction::Create, checkpoint).await?;
        log_query_operation("create_query", &query_id, "created", Some(owning_principal));
        Ok(task)
    }

    pub async fn query_status(&self, query_id: &Uuid) -> CoordinationResult<Option<QueryStatus>> {
        self.cache.query_status(query_id).await
    }

    /// Every query currently tracked by the storage substrate
    pub async fn list_queries(&self) -> CoordinationResult<Vec<QueryStatus>> {
        self.cache.list_query_statuses().await
    }

    /// Refresh the query's last-used time; skipped if the lock is busy
    pub async fn touch(&self, query_id: &Uuid) -> CoordinationResult<()> {
        let mut updater = Lenient(SyncUpdate::new(|status: &mut QueryStatus| {
            status.touch();
            Ok(())
        }));
        self.locked
            .update(QUERY_STATUS, &query_status_key(query_id), &mut updater)
            .await?;
        Ok(())
    }

    pub async fn claim_next_call(&self, query_id: &Uuid) -> CoordinationResult<QueryStatus> {
        let status = self.update_status(query_id, &mut ClaimNextCall).await?;
        debug!(
            query_id = %query_id,
            active = status.active_next_calls,
            limit = status.max_concurrent_next_calls,
            "Next call claimed"
        );
        Ok(status)
    }

    pub async fn release_next_call(&self, query_id: &Uuid) -> CoordinationResult<QueryStatus> {
        let mut release = ReleaseNextCall::new(self.results.clone());
        let status = self.update_status(query_id, &mut release).await?;
        debug!(query_id = %query_id, active = status.active_next_calls, "Next call released");
        Ok(status)
    }

    /// Stop producing results. The result channel is deleted now if no next
    /// call is in flight, otherwise by the last release.
    pub async fn close(&self, query_id: &Uuid) -> CoordinationResult<QueryStatus> {
        let status = self.finish(query_id, QueryState::Close, None).await?;
        log_query_operation("close", query_id, "closed", None);
        Ok(status)
    }

    /// Stop the query and discard outstanding results and READY tasks
    pub async fn cancel(&self, query_id: &Uuid) -> CoordinationResult<QueryStatus> {
        let status = self.finish(query_id, QueryState::Cancel, None).await?;
        self.results.empty_query(&query_id.to_string()).await?;
        let forgotten = self.forget_ready_tasks(query_id).await?;
        log_query_operation("cancel", query_id, "cancelled", Some(&format!("forgot {forgotten} ready tasks")));
        Ok(status)
    }

    /// Mark the query failed, recording why
    pub async fn fail(&self, query_id: &Uuid, message: &str) -> CoordinationResult<QueryStatus> {
        let status = self
            .finish(query_id, QueryState::Failed, Some(message.to_string()))
            .await?;
        log_query_operation("fail", query_id, "failed", Some(message));
        Ok(status)
    }

    /// Delete every record and the result channel of a query. Returns
    /// whether the query existed.
    pub async fn remove_query(&self, query_id: &Uuid) -> CoordinationResult<bool> {
        let existed = self.cache.remove_query_status(query_id).await?;
        self.cache.remove_task_states(query_id).await?;
        let tasks = self.cache.remove_tasks(query_id).await?;
        self.results.delete_query(&query_id.to_string()).await?;
        log_query_operation(
            "remove_query",
            query_id,
            if existed { "removed" } else { "absent" },
            Some(&format!("removed {tasks} tasks")),
        );
        Ok(existed)
    }

    // Tasks

    /// Store a new READY task for the checkpoint's query
    pub async fn create_task(&self, action: TaskAction, checkpoint: QueryCheckpoint) -> CoordinationResult<QueryTask> {
        let query_id = checkpoint.query_key.query_id;
        let mut updater = CreateTask {
            cache: &self.cache,
            action,
            checkpoint: Some(checkpoint),
            created: None,
        };
        self.update_task_states(&query_id, &mut updater).await?;
        let task = updater
            .created
            .ok_or_else(|| CoordinationError::internal("task creation produced no task"))?;
        log_task_operation("create_task", &task.task_key, "ready", None);
        Ok(task)
    }

    pub async fn task(&self, query_id: &Uuid, task_id: TaskId) -> CoordinationResult<Option<QueryTask>> {
        self.cache.task_by_id(query_id, task_id).await
    }

    pub async fn task_states(&self, query_id: &Uuid) -> CoordinationResult<TaskStates> {
        self.cache
            .task_states(query_id)
            .await?
            .ok_or_else(|| CoordinationError::not_found(TASK_STATES, task_states_key(query_id)))
    }

    /// Transition a task, or forget it with `None`. Returns `false` when a
    /// move to RUNNING was refused because every running slot is taken.
    pub async fn update_task_state(&self, task_key: &TaskKey, state: Option<TaskState>) -> CoordinationResult<bool> {
        let mut accepted = false;
        let mut updater = SyncUpdate::new(|states: &mut TaskStates| {
            accepted = states.set_state(task_key.task_id, state);
            Ok(())
        });
        self.update_task_states(&task_key.query_id(), &mut updater).await?;

        let outcome = match (accepted, state) {
            (false, _) => "refused".to_string(),
            (true, Some(state)) => state.to_string(),
            (true, None) => "forgotten".to_string(),
        };
        log_task_operation("update_task_state", task_key, &outcome, None);
        Ok(accepted)
    }

    /// Start a task: READY moves to RUNNING if a slot is free. A task in any
    /// other state, or one that was forgotten, is left alone.
    pub async fn admit_task(&self, task_key: &TaskKey) -> CoordinationResult<TaskAdmission> {
        let mut admit = AdmitReadyTask::new(task_key.task_id);
        self.update_task_states(&task_key.query_id(), &mut admit).await?;
        let admission = admit
            .admission()
            .ok_or_else(|| CoordinationError::internal("task admission did not run"))?;
        let outcome = match admission {
            TaskAdmission::Admitted => "running".to_string(),
            TaskAdmission::NoSlot => "no_slot".to_string(),
            TaskAdmission::NotReady(Some(state)) => format!("not_ready:{state}"),
            TaskAdmission::NotReady(None) => "not_ready:forgotten".to_string(),
        };
        log_task_operation("admit_task", task_key, &outcome, None);
        Ok(admission)
    }

    /// Up to `max_tasks` READY tasks, lowest id first
    pub async fn ready_tasks(&self, query_id: &Uuid, max_tasks: usize) -> CoordinationResult<Vec<QueryTask>> {
        let states = self.task_states(query_id).await?;
        let mut tasks = Vec::new();
        for task_id in states.task_ids_for_state(TaskState::Ready, max_tasks) {
            match self.cache.task_by_id(query_id, task_id).await? {
                Some(task) => tasks.push(task),
                None => warn!(query_id = %query_id, task_id = task_id, "READY task has no stored record"),
            }
        }
        Ok(tasks)
    }

    /// Lightweight references to up to `max_tasks` READY tasks, for handing
    /// to workers without their checkpoints
    pub async fn ready_task_descriptions(
        &self,
        query_id: &Uuid,
        max_tasks: usize,
    ) -> CoordinationResult<Vec<TaskDescription>> {
        Ok(self
            .ready_tasks(query_id, max_tasks)
            .await?
            .iter()
            .map(TaskDescription::from)
            .collect())
    }

    // Internals

    async fn update_status<U>(&self, query_id: &Uuid, updater: &mut U) -> CoordinationResult<QueryStatus>
    where
        U: CacheUpdater<QueryStatus> + ?Sized,
    {
        let key = query_status_key(query_id);
        self.locked
            .update(QUERY_STATUS, &key, updater)
            .await?
            .ok_or_else(|| CoordinationError::lock_timeout(key, 0))
    }

    async fn update_task_states<U>(&self, query_id: &Uuid, updater: &mut U) -> CoordinationResult<TaskStates>
    where
        U: CacheUpdater<TaskStates> + ?Sized,
    {
        let key = task_states_key(query_id);
        self.locked
            .update(TASK_STATES, &key, updater)
            .await?
            .ok_or_else(|| CoordinationError::lock_timeout(key, 0))
    }

    /// Move the query into a terminal state and delete the channel if idle
    async fn finish(
        &self,
        query_id: &Uuid,
        target: QueryState,
        failure_message: Option<String>,
    ) -> CoordinationResult<QueryStatus> {
        let mut updater = SyncUpdate::new(|status: &mut QueryStatus| {
            if status.query_state.is_terminal() && status.query_state != target {
                return Err(CoordinationError::invalid_state(
                    status.query_key.query_id.to_string(),
                    status.query_state.to_string(),
                    format!("transition to {target}"),
                ));
            }
            status.query_state = target;
            if failure_message.is_some() {
                status.failure_message = failure_message.clone();
            }
            status.touch();
            Ok(())
        });
        let status = self.update_status(query_id, &mut updater).await?;

        if status.is_idle() {
            self.results.delete_query(&query_id.to_string()).await?;
        } else {
            debug!(
                query_id = %query_id,
                active = status.active_next_calls,
                "Next calls in flight, channel deleted on last release"
            );
        }
        Ok(status)
    }

    async fn forget_ready_tasks(&self, query_id: &Uuid) -> CoordinationResult<usize> {
        let mut forgotten: Vec<TaskId> = Vec::new();
        let mut updater = SyncUpdate::new(|states: &mut TaskStates| {
            forgotten = states.task_ids_for_state(TaskState::Ready, usize::MAX).collect();
            for task_id in &forgotten {
                states.set_state(*task_id, None);
            }
            Ok(())
        });
        self.update_task_states(query_id, &mut updater).await?;

        for task_id in &forgotten {
            self.cache.remove_record(&query_task_key(query_id, *task_id)).await?;
        }
        Ok(forgotten.len())
    }
}
