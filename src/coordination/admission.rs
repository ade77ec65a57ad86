//! # Admission Control
//!
//! Bounds how many "next page" calls run concurrently against one query, and
//! admits READY tasks into running slots. Every updater here runs inside
//! [`LockedCacheUpdate`](super::LockedCacheUpdate) so that two racing callers
//! can never both observe a free slot.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::locked_update::CacheUpdater;
use crate::error::{CoordinationError, CoordinationResult};
use crate::messaging::QueryResultsManager;
use crate::models::{QueryState, QueryStatus, TaskId};
use crate::state_machine::{TaskState, TaskStates};

/// Claims a next-call slot. Legal only while the query is in `Create`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaimNextCall;

#[async_trait]
impl CacheUpdater<QueryStatus> for ClaimNextCall {
    async fn apply(&mut self, status: &mut QueryStatus) -> CoordinationResult<()> {
        let query_id = status.query_key.query_id.to_string();
        if status.query_state != QueryState::Create {
            return Err(CoordinationError::invalid_state(
                query_id,
                status.query_state.to_string(),
                "claim_next_call",
            ));
        }
        if status.active_next_calls >= status.max_concurrent_next_calls {
            debug!(
                query_id = %query_id,
                active = status.active_next_calls,
                limit = status.max_concurrent_next_calls,
                "Next call refused, concurrency limit reached"
            );
            return Err(CoordinationError::concurrency_limit(
                query_id,
                status.max_concurrent_next_calls,
            ));
        }
        status.active_next_calls += 1;
        status.touch();
        Ok(())
    }
}

/// Releases a next-call slot and, once the query has stopped running,
/// deletes its result channel.
///
/// The decrement happens first, then liveness is checked, so a straggling
/// caller never deletes results an in-flight sibling still needs.
pub struct ReleaseNextCall {
    results: Arc<dyn QueryResultsManager>,
}

impl ReleaseNextCall {
    pub fn new(results: Arc<dyn QueryResultsManager>) -> Self {
        Self { results }
    }
}

impl std::fmt::Debug for ReleaseNextCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseNextCall")
            .field("backend", &self.results.backend_name())
            .finish()
    }
}

#[async_trait]
impl CacheUpdater<QueryStatus> for ReleaseNextCall {
    async fn apply(&mut self, status: &mut QueryStatus) -> CoordinationResult<()> {
        let query_id = status.query_key.query_id.to_string();
        if status.active_next_calls == 0 {
            error!(query_id = %query_id, "Next call released with none active");
            return Err(CoordinationError::internal(format!(
                "no next call is active for query {query_id}"
            )));
        }
        status.active_next_calls -= 1;
        status.touch();

        if !status.is_running() {
            info!(
                query_id = %query_id,
                state = %status.query_state,
                "🧹 Query no longer running, deleting result channel"
            );
            self.results.delete_query(&query_id).await?;
        }
        Ok(())
    }
}

/// Outcome of trying to start a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAdmission {
    /// The task moved from READY to RUNNING
    Admitted,
    /// The task is READY but every running slot is taken
    NoSlot,
    /// The task is not READY: already running, finished, or forgotten
    NotReady(Option<TaskState>),
}

/// Moves one task from READY to RUNNING. Any other current state is left
/// untouched, so a task is admitted at most once.
#[derive(Debug)]
pub struct AdmitReadyTask {
    task_id: TaskId,
    admission: Option<TaskAdmission>,
}

impl AdmitReadyTask {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            admission: None,
        }
    }

    /// What the last application decided, if it ran
    pub fn admission(&self) -> Option<TaskAdmission> {
        self.admission
    }
}

#[async_trait]
impl CacheUpdater<TaskStates> for AdmitReadyTask {
    async fn apply(&mut self, states: &mut TaskStates) -> CoordinationResult<()> {
        let admission = match states.state(self.task_id) {
            Some(TaskState::Ready) => {
                if states.set_state(self.task_id, Some(TaskState::Running)) {
                    TaskAdmission::Admitted
                } else {
                    TaskAdmission::NoSlot
                }
            }
            other => {
                debug!(
                    query_id = %states.query_key.query_id,
                    task_id = self.task_id,
                    state = ?other,
                    "Task not admitted, it is not READY"
                );
                TaskAdmission::NotReady(other)
            }
        };
        self.admission = Some(admission);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingConfig;
    use crate::messaging::{MessagingProvider, ResultMessage};
    use crate::models::QueryKey;
    use std::time::Duration;
    use uuid::Uuid;

    fn created(max: u32) -> QueryStatus {
        let mut status = QueryStatus::new(QueryKey::new("pool", Uuid::new_v4(), "logic"), "alice", max);
        status.query_state = QueryState::Create;
        status
    }

    #[tokio::test]
    async fn test_claim_until_limit() {
        let mut status = created(2);
        ClaimNextCall.apply(&mut status).await.unwrap();
        ClaimNextCall.apply(&mut status).await.unwrap();
        assert_eq!(status.active_next_calls, 2);

        let err = ClaimNextCall.apply(&mut status).await.unwrap_err();
        assert!(matches!(err, CoordinationError::ConcurrencyLimitExceeded { limit: 2, .. }));
        assert!(err.is_retryable());
        assert_eq!(status.active_next_calls, 2);
    }

    #[tokio::test]
    async fn test_claim_requires_create_state() {
        for state in [QueryState::Defined, QueryState::Plan, QueryState::Close, QueryState::Cancel] {
            let mut status = created(1);
            status.query_state = state;
            let err = ClaimNextCall.apply(&mut status).await.unwrap_err();
            assert!(matches!(err, CoordinationError::InvalidState { .. }), "{state}");
            assert_eq!(status.active_next_calls, 0);
        }
    }

    #[tokio::test]
    async fn test_release_at_zero_is_fatal_and_keeps_channel() {
        let results = Arc::new(MessagingProvider::from_config(&MessagingConfig::default()));
        let mut status = created(1);
        status.query_state = QueryState::Close;
        let query_id = status.query_key.query_id.to_string();

        let publisher = results.create_publisher(&query_id).await.unwrap();
        publisher
            .publish(ResultMessage::new("r1", serde_json::json!(1)), Duration::from_millis(100))
            .await
            .unwrap();

        let err = ReleaseNextCall::new(results.clone()).apply(&mut status).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Internal { .. }));
        assert_eq!(results.num_results_remaining(&query_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_tears_down_only_after_query_stops() {
        let results = Arc::new(MessagingProvider::from_config(&MessagingConfig::default()));
        let mut status = created(2);
        let query_id = status.query_key.query_id.to_string();
        ClaimNextCall.apply(&mut status).await.unwrap();
        ClaimNextCall.apply(&mut status).await.unwrap();

        let publisher = results.create_publisher(&query_id).await.unwrap();
        publisher
            .publish(ResultMessage::new("r1", serde_json::json!(1)), Duration::from_millis(100))
            .await
            .unwrap();

        let mut release = ReleaseNextCall::new(results.clone());
        release.apply(&mut status).await.unwrap();
        assert_eq!(results.num_results_remaining(&query_id).await.unwrap(), 1);

        status.query_state = QueryState::Close;
        release.apply(&mut status).await.unwrap();
        assert_eq!(status.active_next_calls, 0);
        assert_eq!(results.num_results_remaining(&query_id).await.unwrap(), 0);
    }

    fn states_with(max_running: u32, ready: &[TaskId]) -> TaskStates {
        let mut states = TaskStates::new(QueryKey::new("pool", Uuid::new_v4(), "logic"), max_running);
        for task_id in ready {
            states.set_state(*task_id, Some(TaskState::Ready));
        }
        states
    }

    #[tokio::test]
    async fn test_ready_task_admitted_once() {
        let mut states = states_with(2, &[1]);

        let mut first = AdmitReadyTask::new(1);
        first.apply(&mut states).await.unwrap();
        assert_eq!(first.admission(), Some(TaskAdmission::Admitted));

        let mut second = AdmitReadyTask::new(1);
        second.apply(&mut states).await.unwrap();
        assert_eq!(second.admission(), Some(TaskAdmission::NotReady(Some(TaskState::Running))));
        assert_eq!(states.running_task_count(), 1);
    }

    #[tokio::test]
    async fn test_finished_and_forgotten_tasks_stay_put() {
        let mut states = states_with(2, &[1]);
        states.set_state(1, Some(TaskState::Completed));

        let mut completed = AdmitReadyTask::new(1);
        completed.apply(&mut states).await.unwrap();
        assert_eq!(completed.admission(), Some(TaskAdmission::NotReady(Some(TaskState::Completed))));
        assert_eq!(states.state(1), Some(TaskState::Completed));

        let mut forgotten = AdmitReadyTask::new(7);
        forgotten.apply(&mut states).await.unwrap();
        assert_eq!(forgotten.admission(), Some(TaskAdmission::NotReady(None)));
        assert_eq!(states.state(7), None);
    }

    #[tokio::test]
    async fn test_no_slot_leaves_task_ready() {
        let mut states = states_with(1, &[1, 2]);
        AdmitReadyTask::new(1).apply(&mut states).await.unwrap();

        let mut blocked = AdmitReadyTask::new(2);
        blocked.apply(&mut states).await.unwrap();
        assert_eq!(blocked.admission(), Some(TaskAdmission::NoSlot));
        assert_eq!(states.state(2), Some(TaskState::Ready));
    }
}
