//! Proptest strategies for task-state transitions

use proptest::prelude::*;
use query_coordinator::state_machine::TaskState;

pub fn task_state_strategy() -> impl Strategy<Value = Option<TaskState>> {
    prop_oneof![
        Just(Some(TaskState::Ready)),
        Just(Some(TaskState::Running)),
        Just(Some(TaskState::Completed)),
        Just(Some(TaskState::Failed)),
        Just(None),
    ]
}

/// Transitions over a small id space so ids collide often
pub fn transition_strategy() -> impl Strategy<Value = Vec<(u32, Option<TaskState>)>> {
    prop::collection::vec((1u32..40, task_state_strategy()), 0..200)
}
