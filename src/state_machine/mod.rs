//! # Task State Machine
//!
//! Tracks which tasks of a query are ready, running, completed or failed,
//! hands out task ids and applies back-pressure on running tasks.

pub mod id_set;
pub mod task_states;

pub use id_set::TaskIdSet;
pub use task_states::{TaskState, TaskStates};
