//! # Query Coordination Models
//!
//! Value types shared by the task-state machine, the coordinator and the
//! result-delivery layer: query and task identity, checkpoints, tasks and the
//! per-query status record.

pub mod checkpoint;
pub mod query_status;
pub mod query_task;
pub mod task_key;

pub use checkpoint::QueryCheckpoint;
pub use query_status::{QueryState, QueryStatus};
pub use query_task::{QueryTask, TaskDescription};
pub use task_key::{QueryKey, TaskAction, TaskId, TaskKey};
