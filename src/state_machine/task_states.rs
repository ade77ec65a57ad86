//! Per-query task state tracking.
//!
//! `TaskStates` is the record that bounds how many tasks of a query may run at
//! once. It is stored in the shared cache and is only mutated through the
//! locked update protocol, so none of its methods synchronize internally.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::id_set::TaskIdSet;
use crate::constants::FIRST_TASK_ID;
use crate::error::{CoordinationError, CoordinationResult};
use crate::models::{QueryKey, TaskId};

/// Execution state of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a running slot
    Ready,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [Self::Ready, Self::Running, Self::Completed, Self::Failed];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

fn first_task_id() -> TaskId {
    FIRST_TASK_ID
}

/// Task ids of one query grouped by state.
///
/// A task id is a member of at most one state set. `Running` membership is
/// capped at `max_running` when a transition is attempted; lowering
/// `max_running` later does not evict running tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStates {
    pub query_key: QueryKey,
    max_running: u32,
    #[serde(default = "first_task_id")]
    next_task_id: TaskId,
    #[serde(default)]
    states: BTreeMap<TaskState, TaskIdSet>,
}

impl TaskStates {
    pub fn new(query_key: QueryKey, max_running: u32) -> Self {
        Self {
            query_key,
            max_running,
            next_task_id: FIRST_TASK_ID,
            states: BTreeMap::new(),
        }
    }

    /// The id the next call to [`new_task_id`](Self::new_task_id) will hand out
    pub fn next_task_id(&self) -> TaskId {
        self.next_task_id
    }

    /// Allocate a task id. Ids are never reused within a query, so the id
    /// space running out is an error rather than a wrap-around.
    pub fn new_task_id(&mut self) -> CoordinationResult<TaskId> {
        let task_id = self.next_task_id;
        self.next_task_id = task_id.checked_add(1).ok_or_else(|| {
            CoordinationError::internal(format!("task ids exhausted for query {}", self.query_key))
        })?;
        Ok(task_id)
    }

    pub fn max_running(&self) -> u32 {
        self.max_running
    }

    pub fn set_max_running(&mut self, max_running: u32) {
        self.max_running = max_running;
    }

    /// Number of tasks that could start running right now
    pub fn available_running_slots(&self) -> u32 {
        self.max_running.saturating_sub(self.running_task_count() as u32)
    }

    /// Number of ready tasks that could start running right now
    pub fn available_ready_tasks_to_run(&self) -> u32 {
        self.available_running_slots()
            .min(self.ready_task_count() as u32)
    }

    pub fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.states
            .iter()
            .find(|(_, ids)| ids.contains(task_id))
            .map(|(state, _)| *state)
    }

    /// Move a task to `new_state`, or forget it entirely with `None`.
    ///
    /// Returns false, leaving everything untouched, only when the target is
    /// `Running` and every running slot is taken. Setting the state a task is
    /// already in is a successful no-op.
    pub fn set_state(&mut self, task_id: TaskId, new_state: Option<TaskState>) -> bool {
        let current = self.state(task_id);
        if current == new_state {
            return true;
        }
        if new_state == Some(TaskState::Running) && self.available_running_slots() == 0 {
            return false;
        }
        if let Some(current) = current {
            if let Some(ids) = self.states.get_mut(&current) {
                ids.remove(task_id);
            }
        }
        if let Some(new_state) = new_state {
            self.states.entry(new_state).or_default().insert(task_id);
        }
        true
    }

    pub fn task_count_for_state(&self, state: TaskState) -> usize {
        self.states.get(&state).map_or(0, TaskIdSet::len)
    }

    pub fn ready_task_count(&self) -> usize {
        self.task_count_for_state(TaskState::Ready)
    }

    pub fn running_task_count(&self) -> usize {
        self.task_count_for_state(TaskState::Running)
    }

    pub fn completed_task_count(&self) -> usize {
        self.task_count_for_state(TaskState::Completed)
    }

    pub fn failed_task_count(&self) -> usize {
        self.task_count_for_state(TaskState::Failed)
    }

    pub fn has_tasks_for_state(&self, state: TaskState) -> bool {
        self.task_count_for_state(state) > 0
    }

    pub fn has_ready_tasks(&self) -> bool {
        self.has_tasks_for_state(TaskState::Ready)
    }

    pub fn has_running_tasks(&self) -> bool {
        self.has_tasks_for_state(TaskState::Running)
    }

    pub fn has_completed_tasks(&self) -> bool {
        self.has_tasks_for_state(TaskState::Completed)
    }

    pub fn has_failed_tasks(&self) -> bool {
        self.has_tasks_for_state(TaskState::Failed)
    }

    /// Ready or running tasks remain
    pub fn has_unfinished_tasks(&self) -> bool {
        self.has_ready_tasks() || self.has_running_tasks()
    }

    /// Up to `max_tasks` ids in `state`, ascending. Each call starts from the
    /// lowest id and nothing is collected up front.
    pub fn task_ids_for_state(
        &self,
        state: TaskState,
        max_tasks: usize,
    ) -> impl Iterator<Item = TaskId> + '_ {
        self.states
            .get(&state)
            .into_iter()
            .flat_map(TaskIdSet::iter)
            .take(max_tasks)
    }

    /// Per-state counts, e.g. `READY:2,RUNNING:1,COMPLETED:0,FAILED:0`
    pub fn task_states_summary(&self) -> String {
        TaskState::ALL
            .iter()
            .map(|state| {
                format!(
                    "{}:{}",
                    state.to_string().to_uppercase(),
                    self.task_count_for_state(*state)
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for TaskStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TaskStates {{ query: {}, max_running: {}, {} }}",
            self.query_key,
            self.max_running,
            self.task_states_summary()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn task_states(max_running: u32) -> TaskStates {
        TaskStates::new(QueryKey::new("default", Uuid::new_v4(), "EventQuery"), max_running)
    }

    #[test]
    fn test_task_ids_start_at_one_and_increase() {
        let mut states = task_states(1);
        assert_eq!(states.next_task_id(), 1);
        assert_eq!(states.new_task_id().unwrap(), 1);
        assert_eq!(states.new_task_id().unwrap(), 2);
        assert_eq!(states.next_task_id(), 3);
    }

    #[test]
    fn test_exhausted_id_space_is_an_error() {
        let mut states = task_states(1);
        states.next_task_id = TaskId::MAX - 1;
        assert_eq!(states.new_task_id().unwrap(), TaskId::MAX - 1);

        let err = states.new_task_id().unwrap_err();
        assert!(matches!(err, CoordinationError::Internal { .. }));
        assert_eq!(states.next_task_id(), TaskId::MAX);
    }

    #[test]
    fn test_running_limit_refuses_without_mutation() {
        let mut states = task_states(1);
        assert!(states.set_state(1, Some(TaskState::Ready)));
        assert!(states.set_state(2, Some(TaskState::Ready)));
        assert!(states.set_state(1, Some(TaskState::Running)));

        assert!(!states.set_state(2, Some(TaskState::Running)));
        assert_eq!(states.state(2), Some(TaskState::Ready));
        assert_eq!(states.running_task_count(), 1);
    }

    #[test]
    fn test_same_state_is_noop_even_when_full() {
        let mut states = task_states(1);
        assert!(states.set_state(1, Some(TaskState::Running)));
        assert!(states.set_state(1, Some(TaskState::Running)));
        assert_eq!(states.running_task_count(), 1);
    }

    #[test]
    fn test_none_forgets_task() {
        let mut states = task_states(2);
        states.set_state(4, Some(TaskState::Failed));
        assert!(states.set_state(4, None));
        assert_eq!(states.state(4), None);
        // unknown id
        assert!(states.set_state(99, None));
        assert_eq!(states.failed_task_count(), 0);
    }

    #[test]
    fn test_available_slots() {
        let mut states = task_states(3);
        for id in 1..=5 {
            states.set_state(id, Some(TaskState::Ready));
        }
        states.set_state(1, Some(TaskState::Running));
        assert_eq!(states.available_running_slots(), 2);
        assert_eq!(states.available_ready_tasks_to_run(), 2);

        states.set_max_running(0);
        assert_eq!(states.available_running_slots(), 0);
        assert!(states.has_unfinished_tasks());
    }

    #[test]
    fn test_task_ids_for_state_is_bounded_and_restartable() {
        let mut states = task_states(1);
        for id in [9, 2, 5, 7] {
            states.set_state(id, Some(TaskState::Ready));
        }
        let first: Vec<_> = states.task_ids_for_state(TaskState::Ready, 2).collect();
        assert_eq!(first, vec![2, 5]);
        let again: Vec<_> = states.task_ids_for_state(TaskState::Ready, 10).collect();
        assert_eq!(again, vec![2, 5, 7, 9]);
        assert_eq!(states.task_ids_for_state(TaskState::Failed, 10).count(), 0);
    }

    #[test]
    fn test_summary() {
        let mut states = task_states(2);
        states.set_state(1, Some(TaskState::Ready));
        states.set_state(2, Some(TaskState::Running));
        assert_eq!(
            states.task_states_summary(),
            "READY:1,RUNNING:1,COMPLETED:0,FAILED:0"
        );
    }

    #[test]
    fn test_serialized_form_is_compact() {
        let mut states = task_states(2);
        for id in 1..=1000 {
            states.set_state(id, Some(TaskState::Completed));
        }
        let json = serde_json::to_value(&states).unwrap();
        assert_eq!(json["states"]["completed"], "1-1000");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(TaskId, Option<TaskState>),
        SetMax(u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let state = prop_oneof![
            Just(None),
            Just(Some(TaskState::Ready)),
            Just(Some(TaskState::Running)),
            Just(Some(TaskState::Completed)),
            Just(Some(TaskState::Failed)),
        ];
        prop_oneof![
            8 => (1u32..20, state).prop_map(|(id, s)| Op::Set(id, s)),
            1 => (0u32..5).prop_map(Op::SetMax),
        ]
    }

    proptest! {
        #[test]
        fn prop_each_id_in_at_most_one_state(ops in proptest::collection::vec(op_strategy(), 0..200)) {
            let mut states = task_states(2);
            for op in ops {
                match op {
                    Op::Set(id, target) => {
                        let before = states.clone();
                        let running = states.running_task_count();
                        let accepted = states.set_state(id, target);
                        if target == Some(TaskState::Running) && before.state(id) != target {
                            prop_assert_eq!(accepted, running < before.max_running() as usize);
                        } else {
                            prop_assert!(accepted);
                        }
                        if !accepted {
                            prop_assert_eq!(&states, &before);
                        }
                    }
                    Op::SetMax(max) => states.set_max_running(max),
                }
                for id in 1u32..20 {
                    let memberships = TaskState::ALL
                        .iter()
                        .filter(|s| states.task_ids_for_state(**s, usize::MAX).any(|t| t == id))
                        .count();
                    prop_assert!(memberships <= 1);
                }
            }
        }

        #[test]
        fn prop_serde_preserves_membership(ops in proptest::collection::vec((1u32..500, 0usize..4), 0..100)) {
            let mut states = task_states(u32::MAX);
            for (id, state) in ops {
                states.set_state(id, Some(TaskState::ALL[state]));
            }
            let json = serde_json::to_string(&states).unwrap();
            let parsed: TaskStates = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(parsed, states);
        }
    }
}
