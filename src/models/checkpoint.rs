use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::task_key::QueryKey;

/// Snapshot of the query configuration and progress needed to perform one
/// task. Checkpoints are never mutated; each completed task produces a new one
/// to seed its follow-on tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCheckpoint {
    pub query_key: QueryKey,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl QueryCheckpoint {
    pub fn new(query_key: QueryKey) -> Self {
        Self {
            query_key,
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property assignment
    pub fn with_property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_checkpoint_properties() {
        let checkpoint = QueryCheckpoint::new(QueryKey::new("pool", Uuid::new_v4(), "logic"))
            .with_property("range", json!({"begin": "a", "end": "m"}))
            .with_property("page", json!(3));

        assert_eq!(checkpoint.property("page"), Some(&json!(3)));
        assert!(checkpoint.property("missing").is_none());

        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: QueryCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, checkpoint);
    }
}
