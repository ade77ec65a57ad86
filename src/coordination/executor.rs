//! # Task Executor
//!
//! Worker-side execution of query tasks. A task is admitted from READY to
//! RUNNING under the task-states lock (refused when every running slot is
//! taken, skipped when it is not READY), handed to the registered
//! [`QueryLogic`] for its query, and its result batches and follow-on tasks
//! are recorded before the task is marked COMPLETED or FAILED.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::admission::TaskAdmission;
use super::lifecycle::QueryCoordinator;
use crate::config::CoordinatorConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::logging::log_task_operation;
use crate::messaging::ResultMessage;
use crate::models::{QueryCheckpoint, QueryTask, TaskAction, TaskId, TaskKey};
use crate::state_machine::TaskState;

/// Attempts at recording COMPLETED or FAILED before giving up
const SETTLE_ATTEMPTS: u32 = 4;
const SETTLE_BACKOFF_BASE_MS: u64 = 10;

/// What a query logic produced for one task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    /// Result batches, published in order
    pub results: Vec<ResultMessage>,
    /// Tasks to submit as READY once this one completes
    pub follow_on: Vec<(TaskAction, QueryCheckpoint)>,
}

impl TaskOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, result: ResultMessage) -> Self {
        self.results.push(result);
        self
    }

    pub fn then(mut self, action: TaskAction, checkpoint: QueryCheckpoint) -> Self {
        self.follow_on.push((action, checkpoint));
        self
    }
}

/// Pluggable query execution strategy, looked up by query logic name
#[async_trait]
pub trait QueryLogic: Send + Sync {
    fn name(&self) -> &str;

    /// Perform one task against its checkpoint
    async fn execute(&self, task: &QueryTask) -> CoordinationResult<TaskOutcome>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskExecution {
    Completed {
        task_id: TaskId,
        published: usize,
        follow_on: Vec<TaskId>,
    },
    Failed {
        task_id: TaskId,
        message: String,
    },
    /// Every running slot was taken; the task stays READY
    Refused { task_id: TaskId },
    /// The task was not READY (already running, finished or forgotten) and
    /// was not run
    NotReady {
        task_id: TaskId,
        state: Option<TaskState>,
    },
    /// The task ran but its final state could not be recorded, so it is
    /// still RUNNING in storage and holds a running slot
    Unsettled {
        task_id: TaskId,
        intended: TaskState,
        message: String,
    },
}

impl TaskExecution {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Refused { task_id }
            | Self::NotReady { task_id, .. }
            | Self::Unsettled { task_id, .. } => *task_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Refused { .. } => "refused",
            Self::NotReady { .. } => "not_ready",
            Self::Unsettled { .. } => "unsettled",
        }
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    coordinator: Arc<QueryCoordinator>,
    logic: Arc<RwLock<HashMap<String, Arc<dyn QueryLogic>>>>,
    publish_timeout: Duration,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("coordinator", &self.coordinator)
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}

impl TaskExecutor {
    pub fn new(coordinator: Arc<QueryCoordinator>, config: &CoordinatorConfig) -> Self {
        Self {
            coordinator,
            logic: Arc::new(RwLock::new(HashMap::new())),
            publish_timeout: config.next_call.max_results_timeout(),
        }
    }

    pub fn coordinator(&self) -> &Arc<QueryCoordinator> {
        &self.coordinator
    }

    pub async fn register_logic(&self, logic: Arc<dyn QueryLogic>) {
        let name = logic.name().to_string();
        if self.logic.write().await.insert(name.clone(), logic).is_some() {
            warn!(query_logic = %name, "Replacing existing query logic");
        }
        info!(query_logic = %name, "Registered query logic");
    }

    /// Admit and run one task
    #[instrument(skip(self), fields(query_id = %task_key.query_id(), task_id = task_key.task_id))]
    pub async fn execute(&self, task_key: &TaskKey) -> CoordinationResult<TaskExecution> {
        let task_id = task_key.task_id;
        match self.coordinator.admit_task(task_key).await? {
            TaskAdmission::Admitted => {}
            TaskAdmission::NoSlot => {
                debug!("No running slot available");
                return Ok(TaskExecution::Refused { task_id });
            }
            TaskAdmission::NotReady(state) => {
                debug!(state = ?state, "Task is not READY, skipping");
                return Ok(TaskExecution::NotReady { task_id, state });
            }
        }

        let started = Instant::now();
        let (intended, execution) = match self.run(task_key).await {
            Ok((published, follow_on)) => (
                TaskState::Completed,
                TaskExecution::Completed {
                    task_id,
                    published,
                    follow_on,
                },
            ),
            Err(e) => {
                error!(error = %e, "Task execution failed");
                (
                    TaskState::Failed,
                    TaskExecution::Failed {
                        task_id,
                        message: e.to_string(),
                    },
                )
            }
        };

        let execution = match self.settle(task_key, intended).await {
            Ok(()) => execution,
            Err(e) => {
                error!(
                    intended = %intended,
                    error = %e,
                    "❌ Could not record final task state, task is still RUNNING"
                );
                TaskExecution::Unsettled {
                    task_id,
                    intended,
                    message: e.to_string(),
                }
            }
        };

        if let TaskExecution::Failed { message, .. } = &execution {
            if task_key.action == TaskAction::Create {
                if let Err(fail_error) = self.coordinator.fail(&task_key.query_id(), message).await {
                    warn!(error = %fail_error, "Could not mark query failed");
                }
            }
        }

        log_task_operation(
            "execute",
            task_key,
            execution.label(),
            Some(&format!("{}ms", started.elapsed().as_millis())),
        );
        Ok(execution)
    }

    /// Run up to as many READY tasks of the query as there are free running
    /// slots, concurrently. Every spawned task is awaited before returning;
    /// if any of them errored, the first error is returned.
    pub async fn run_ready(&self, query_id: &Uuid) -> CoordinationResult<Vec<TaskExecution>> {
        let states = self.coordinator.task_states(query_id).await?;
        let capacity = states.available_ready_tasks_to_run() as usize;
        if capacity == 0 {
            return Ok(Vec::new());
        }

        let handles: Vec<_> = self
            .coordinator
            .ready_task_descriptions(query_id, capacity)
            .await?
            .into_iter()
            .map(|description| {
                let executor = self.clone();
                tokio::spawn(async move { executor.execute(&description.task_key).await })
            })
            .collect();

        let mut executions = Vec::with_capacity(handles.len());
        let mut first_error = None;
        let mut errors = 0;
        for joined in join_all(handles).await {
            let outcome = joined.unwrap_or_else(|e| {
                error!(query_id = %query_id, error = %e, "Task execution panicked");
                Err(CoordinationError::internal(format!("task execution panicked: {e}")))
            });
            match outcome {
                Ok(execution) => executions.push(execution),
                Err(e) => {
                    warn!(query_id = %query_id, error = %e, "Ready task could not be executed");
                    errors += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            query_id = %query_id,
            executed = executions.len(),
            completed = executions.iter().filter(|e| e.is_completed()).count(),
            errors = errors,
            "Ready tasks executed"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(executions),
        }
    }

    /// Record COMPLETED or FAILED, retrying contention with backoff
    async fn settle(&self, task_key: &TaskKey, state: TaskState) -> CoordinationResult<()> {
        let mut attempt = 0;
        loop {
            match self.coordinator.update_task_state(task_key, Some(state)).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < SETTLE_ATTEMPTS => {
                    let delay_ms = SETTLE_BACKOFF_BASE_MS * 2_u64.pow(attempt);
                    warn!(
                        state = %state,
                        attempt = attempt,
                        delay_ms = delay_ms,
                        error = %e,
                        "Final task state not recorded, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run(&self, task_key: &TaskKey) -> CoordinationResult<(usize, Vec<TaskId>)> {
        let query_id = task_key.query_id();
        let task = self
            .coordinator
            .task(&query_id, task_key.task_id)
            .await?
            .ok_or_else(|| CoordinationError::not_found("query task", task_key.to_key()))?;

        let logic = self
            .logic
            .read()
            .await
            .get(&task_key.query_key.query_logic)
            .cloned()
            .ok_or_else(|| {
                CoordinationError::configuration(
                    "query_logic",
                    format!("no query logic registered as {}", task_key.query_key.query_logic),
                )
            })?;

        let outcome = logic.execute(&task).await?;

        let published = outcome.results.len();
        if published > 0 && !task_key.action.produces_results() {
            return Err(CoordinationError::invalid_state(
                task_key.to_key(),
                task_key.action.to_string(),
                format!("publish {published} results"),
            ));
        }
        if published > 0 {
            let publisher = self
                .coordinator
                .results()
                .create_publisher(&query_id.to_string())
                .await?;
            for result in outcome.results {
                let result_id = result.id.clone();
                if !publisher.publish(result, self.publish_timeout).await? {
                    return Err(CoordinationError::transport(
                        self.coordinator.results().backend_name(),
                        "publish",
                        format!("result {result_id} not confirmed within {:?}", self.publish_timeout),
                    ));
                }
            }
        }

        let mut follow_on = Vec::with_capacity(outcome.follow_on.len());
        for (action, checkpoint) in outcome.follow_on {
            follow_on.push(self.coordinator.create_task(action, checkpoint).await?.task_id());
        }
        Ok((published, follow_on))
    }
}
