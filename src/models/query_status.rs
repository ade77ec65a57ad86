use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::task_key::QueryKey;

/// Lifecycle state of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    /// Defined but not yet created
    Defined,
    /// Created and producing results; the only state in which next calls are admitted
    Create,
    /// Planning only, no results are produced
    Plan,
    /// Predicting only, no results are produced
    Predict,
    /// Closed by the client, in-flight results may still drain
    Close,
    /// Cancelled, outstanding results are discarded
    Cancel,
    /// Failed
    Failed,
}

impl QueryState {
    /// Whether results may still be produced or requested
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Create)
    }

    /// Whether no further lifecycle transitions are expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Close | Self::Cancel | Self::Failed)
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defined => write!(f, "defined"),
            Self::Create => write!(f, "create"),
            Self::Plan => write!(f, "plan"),
            Self::Predict => write!(f, "predict"),
            Self::Close => write!(f, "close"),
            Self::Cancel => write!(f, "cancel"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl Default for QueryState {
    fn default() -> Self {
        Self::Defined
    }
}

/// Per-query mutable record, only ever mutated through the locked update
/// protocol.
///
/// Invariant: `active_next_calls <= max_concurrent_next_calls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStatus {
    pub query_key: QueryKey,
    pub query_state: QueryState,
    pub active_next_calls: u32,
    pub max_concurrent_next_calls: u32,
    pub last_used_millis: i64,
    pub owning_principal: String,
    #[serde(default)]
    pub failure_message: Option<String>,
}

impl QueryStatus {
    pub fn new(
        query_key: QueryKey,
        owning_principal: impl Into<String>,
        max_concurrent_next_calls: u32,
    ) -> Self {
        Self {
            query_key,
            query_state: QueryState::Defined,
            active_next_calls: 0,
            max_concurrent_next_calls,
            last_used_millis: Utc::now().timestamp_millis(),
            owning_principal: owning_principal.into(),
            failure_message: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.query_state.is_running()
    }

    /// Refresh the last-used timestamp
    pub fn touch(&mut self) {
        self.last_used_millis = Utc::now().timestamp_millis();
    }

    /// Whether the query is idle and has no next call in flight
    pub fn is_idle(&self) -> bool {
        self.active_next_calls == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_only_create_is_running() {
        assert!(QueryState::Create.is_running());
        for state in [
            QueryState::Defined,
            QueryState::Plan,
            QueryState::Predict,
            QueryState::Close,
            QueryState::Cancel,
            QueryState::Failed,
        ] {
            assert!(!state.is_running(), "{state} should not be running");
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(QueryState::Close.is_terminal());
        assert!(QueryState::Cancel.is_terminal());
        assert!(QueryState::Failed.is_terminal());
        assert!(!QueryState::Create.is_terminal());
    }

    #[test]
    fn test_status_serde() {
        let mut status = QueryStatus::new(QueryKey::new("pool", Uuid::new_v4(), "logic"), "alice", 2);
        status.query_state = QueryState::Create;
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"query_state\":\"create\""));

        let parsed: QueryStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
        assert!(parsed.is_idle());
    }
}
