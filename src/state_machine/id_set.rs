//! Compact sorted task-id set.
//!
//! Task ids inside a query are allocated sequentially, so the populated ids of
//! any one state tend to form long consecutive runs with sparse gaps. The set
//! serializes as a run-length list such as `"1-3,7,9-12"`, which stays small
//! for millions of ids and does not depend on insertion order.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::models::TaskId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskIdSet {
    ids: BTreeSet<TaskId>,
}

impl TaskIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the id was not already present
    pub fn insert(&mut self, id: TaskId) -> bool {
        self.ids.insert(id)
    }

    /// Returns true if the id was present
    pub fn remove(&mut self, id: TaskId) -> bool {
        self.ids.remove(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ids.iter().copied()
    }

    pub fn first(&self) -> Option<TaskId> {
        self.ids.first().copied()
    }

    /// Consecutive runs as inclusive `(start, end)` pairs
    pub fn runs(&self) -> Vec<(TaskId, TaskId)> {
        let mut runs: Vec<(TaskId, TaskId)> = Vec::new();
        for id in self.iter() {
            match runs.last_mut() {
                Some((_, end)) if end.checked_add(1) == Some(id) => *end = id,
                _ => runs.push((id, id)),
            }
        }
        runs
    }

    /// Run-length string form, e.g. `"1-3,7"`
    pub fn encode(&self) -> String {
        self.runs()
            .into_iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{start}-{end}")
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for TaskIdSet {
    type Err = String;

    /// Parses the run-length form. Overlapping or unsorted runs are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = TaskIdSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (start, end) = match part.split_once('-') {
                Some((start, end)) => (parse_id(start)?, parse_id(end)?),
                None => {
                    let id = parse_id(part)?;
                    (id, id)
                }
            };
            if start > end {
                return Err(format!("Invalid task id range: {part}"));
            }
            set.ids.extend(start..=end);
        }
        Ok(set)
    }
}

fn parse_id(s: &str) -> Result<TaskId, String> {
    s.trim()
        .parse::<TaskId>()
        .map_err(|e| format!("Invalid task id '{s}': {e}"))
}

impl FromIterator<TaskId> for TaskIdSet {
    fn from_iter<I: IntoIterator<Item = TaskId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for TaskIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl Serialize for TaskIdSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for TaskIdSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdSetVisitor;

        impl Visitor<'_> for IdSetVisitor {
            type Value = TaskIdSet;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a run-length encoded task id list such as \"1-3,7\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(IdSetVisitor)
    }
}
