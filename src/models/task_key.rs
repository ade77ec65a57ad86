//! Query and task identity value types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a task within a single query
pub type TaskId = u32;

/// Identity of a query: the pool it runs in, its id, and the query logic that
/// executes it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub query_pool: String,
    pub query_id: Uuid,
    pub query_logic: String,
}

impl QueryKey {
    pub fn new(query_pool: impl Into<String>, query_id: Uuid, query_logic: impl Into<String>) -> Self {
        Self {
            query_pool: query_pool.into(),
            query_id,
            query_logic: query_logic.into(),
        }
    }

    /// Storage key prefix shared by every record of this query
    pub fn to_key(&self) -> String {
        format!("{}:{}:{}", self.query_pool, self.query_id, self.query_logic)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

/// The lifecycle action a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// Create the query and start producing results
    Create,
    /// Produce a query plan without results
    Plan,
    /// Produce the next page of results
    Next,
    /// Close the query, letting in-flight results drain
    Close,
    /// Cancel the query, discarding outstanding results
    Cancel,
}

impl TaskAction {
    /// Whether a task with this action publishes result batches
    pub fn produces_results(&self) -> bool {
        matches!(self, Self::Create | Self::Next)
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Plan => write!(f, "plan"),
            Self::Next => write!(f, "next"),
            Self::Close => write!(f, "close"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

impl std::str::FromStr for TaskAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "plan" => Ok(Self::Plan),
            "next" => Ok(Self::Next),
            "close" => Ok(Self::Close),
            "cancel" => Ok(Self::Cancel),
            _ => Err(format!("Invalid task action: {s}")),
        }
    }
}

/// Immutable identity of one task. Equality and ordering cover every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub task_id: TaskId,
    pub query_key: QueryKey,
    pub action: TaskAction,
}

impl TaskKey {
    pub fn new(task_id: TaskId, query_key: QueryKey, action: TaskAction) -> Self {
        Self {
            task_id,
            query_key,
            action,
        }
    }

    pub fn query_id(&self) -> Uuid {
        self.query_key.query_id
    }

    /// Storage key of the task record
    pub fn to_key(&self) -> String {
        format!("{}:{}", self.query_key.to_key(), self.task_id)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.to_key(), self.action)
    }
}
