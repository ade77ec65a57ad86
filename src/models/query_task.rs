use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::checkpoint::QueryCheckpoint;
use super::task_key::{TaskAction, TaskId, TaskKey};

/// A unit of work: an action to perform against a query checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTask {
    pub task_key: TaskKey,
    pub checkpoint: QueryCheckpoint,
    /// Last time a service interacted with this task
    pub last_updated_millis: i64,
}

impl QueryTask {
    pub fn new(task_id: TaskId, action: TaskAction, checkpoint: QueryCheckpoint) -> Self {
        Self {
            task_key: TaskKey::new(task_id, checkpoint.query_key.clone(), action),
            checkpoint,
            last_updated_millis: Utc::now().timestamp_millis(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_key.task_id
    }

    pub fn action(&self) -> TaskAction {
        self.task_key.action
    }

    /// Refresh the liveness timestamp
    pub fn touch(&mut self) {
        self.last_updated_millis = Utc::now().timestamp_millis();
    }

    pub fn to_debug(&self) -> String {
        self.task_key.to_string()
    }
}

impl fmt::Display for QueryTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} with {} properties; last updated {}",
            self.task_key,
            self.checkpoint.properties.len(),
            self.last_updated_millis
        )
    }
}

/// Lightweight reference to a task, passed between processes instead of the
/// full checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub task_key: TaskKey,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl TaskDescription {
    pub fn new(task_key: TaskKey, parameters: BTreeMap<String, String>) -> Self {
        Self {
            task_key,
            parameters,
        }
    }
}

impl From<&QueryTask> for TaskDescription {
    fn from(task: &QueryTask) -> Self {
        let parameters = task
            .checkpoint
            .properties
            .iter()
            .map(|(name, value)| match value {
                serde_json::Value::String(s) => (name.clone(), s.clone()),
                other => (name.clone(), other.to_string()),
            })
            .collect();
        Self::new(task.task_key.clone(), parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryKey;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_task_key_derived_from_checkpoint() {
        let query_key = QueryKey::new("pool", Uuid::new_v4(), "logic");
        let task = QueryTask::new(3, TaskAction::Next, QueryCheckpoint::new(query_key.clone()));

        assert_eq!(task.task_id(), 3);
        assert_eq!(task.action(), TaskAction::Next);
        assert_eq!(task.task_key.query_key, query_key);
        assert!(task.last_updated_millis > 0);
    }

    #[test]
    fn test_touch_refreshes_timestamp() {
        let query_key = QueryKey::new("pool", Uuid::new_v4(), "logic");
        let mut task = QueryTask::new(1, TaskAction::Create, QueryCheckpoint::new(query_key));
        task.last_updated_millis = 0;
        task.touch();
        assert!(task.last_updated_millis > 0);
    }

    #[test]
    fn test_description_from_task() {
        let query_key = QueryKey::new("pool", Uuid::new_v4(), "logic");
        let checkpoint = QueryCheckpoint::new(query_key)
            .with_property("shard", json!("20240101_1"))
            .with_property("page", json!(2));
        let task = QueryTask::new(5, TaskAction::Next, checkpoint);

        let description = TaskDescription::from(&task);
        assert_eq!(description.task_key, task.task_key);
        assert_eq!(description.parameters["shard"], "20240101_1");
        assert_eq!(description.parameters["page"], "2");
    }
}
