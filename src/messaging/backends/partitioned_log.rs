//! # Partitioned Log Backend
//!
//! Append-only topics split into partitions, consumed through a consumer
//! group whose id is the topic name. Each partition keeps a log start offset,
//! an end offset and the group's committed offset:
//!
//! - ACK commits past the record
//! - NACK seeks back, so the record is redelivered next
//! - Reject commits past the record without consuming it
//!
//! A partition has at most one delivery outstanding at a time, which keeps
//! per-partition order even with several consumers. Records are routed to a
//! partition by hashing the result id. Topics are only created by
//! `ensure_channel`; records sent to a missing topic are dropped unconfirmed.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::PartitionedLogConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::messaging::message::{decode_envelope, Acknowledgement};
use crate::messaging::transport::ResultTransport;

const BACKEND: &str = "partitioned_log";

#[derive(Debug, Default)]
struct Partition {
    /// Offset of `records[0]`
    start_offset: u64,
    records: VecDeque<Vec<u8>>,
    committed: u64,
    in_flight: bool,
}

impl Partition {
    fn end_offset(&self) -> u64 {
        self.start_offset + self.records.len() as u64
    }

    fn record(&self, offset: u64) -> Option<&Vec<u8>> {
        offset
            .checked_sub(self.start_offset)
            .and_then(|index| self.records.get(index as usize))
    }

    fn lag(&self) -> u64 {
        self.end_offset().saturating_sub(self.committed)
    }

    fn fetchable(&self) -> bool {
        !self.in_flight && self.committed < self.end_offset()
    }

    /// Drop records before the committed offset
    fn compact(&mut self) {
        while self.start_offset < self.committed && !self.records.is_empty() {
            self.records.pop_front();
            self.start_offset += 1;
        }
    }
}

#[derive(Debug)]
struct Topic {
    partitions: Vec<Partition>,
}

impl Topic {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Partition::default()).collect(),
        }
    }
}

/// Where a delivered record lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub partition: usize,
    pub offset: u64,
}

#[derive(Debug)]
pub struct PartitionedLogTransport {
    config: PartitionedLogConfig,
    topics: Mutex<HashMap<String, Topic>>,
    arrivals: Notify,
}

impl PartitionedLogTransport {
    pub fn new(config: PartitionedLogConfig) -> Self {
        Self {
            config,
            topics: Mutex::new(HashMap::new()),
            arrivals: Notify::new(),
        }
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.lock().contains_key(topic)
    }

    /// Committed offset of the group on one partition
    pub fn committed_offset(&self, topic: &str, partition: usize) -> Option<u64> {
        self.topics
            .lock()
            .get(topic)
            .and_then(|t| t.partitions.get(partition))
            .map(|p| p.committed)
    }

    fn partition_for(&self, bytes: &[u8], partitions: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        match decode_envelope(bytes) {
            Ok(envelope) => envelope.id.hash(&mut hasher),
            Err(_) => bytes.hash(&mut hasher),
        }
        (hasher.finish() % partitions as u64) as usize
    }
}

impl ResultTransport for PartitionedLogTransport {
    type Delivery = LogPosition;

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn max_message_bytes(&self) -> Option<usize> {
        Some(self.config.max_message_bytes)
    }

    async fn ensure_channel(&self, channel: &str) -> CoordinationResult<()> {
        self.topics
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| Topic::new(self.config.partitions));
        Ok(())
    }

    async fn send(&self, channel: &str, bytes: Vec<u8>, _timeout: Duration) -> CoordinationResult<bool> {
        if bytes.len() > self.config.max_message_bytes {
            return Err(CoordinationError::transport(
                BACKEND,
                "send",
                format!(
                    "record of {} bytes exceeds max message size {}",
                    bytes.len(),
                    self.config.max_message_bytes
                ),
            ));
        }
        {
            let mut topics = self.topics.lock();
            let Some(topic) = topics.get_mut(channel) else {
                warn!(topic = channel, "Record not written: topic does not exist");
                return Ok(false);
            };
            let partition = self.partition_for(&bytes, topic.partitions.len());
            topic.partitions[partition].records.push_back(bytes);
        }
        self.arrivals.notify_waiters();
        Ok(true)
    }

    async fn fetch(&self, channel: &str) -> CoordinationResult<Option<(Vec<u8>, LogPosition)>> {
        let mut topics = self.topics.lock();
        let Some(topic) = topics.get_mut(channel) else {
            return Ok(None);
        };
        for (index, partition) in topic.partitions.iter_mut().enumerate() {
            if !partition.fetchable() {
                continue;
            }
            let offset = partition.committed;
            if let Some(record) = partition.record(offset).cloned() {
                partition.in_flight = true;
                return Ok(Some((
                    record,
                    LogPosition {
                        partition: index,
                        offset,
                    },
                )));
            }
        }
        Ok(None)
    }

    async fn settle(&self, channel: &str, delivery: LogPosition, ack: Acknowledgement) -> CoordinationResult<()> {
        {
            let mut topics = self.topics.lock();
            let Some(partition) = topics
                .get_mut(channel)
                .and_then(|t| t.partitions.get_mut(delivery.partition))
            else {
                return Ok(());
            };
            partition.in_flight = false;
            match ack {
                Acknowledgement::Ack | Acknowledgement::Reject => {
                    partition.committed = partition.committed.max(delivery.offset + 1);
                    partition.compact();
                }
                // The committed offset still points at the record
                Acknowledgement::Nack => {}
            }
            debug!(
                topic = channel,
                partition = delivery.partition,
                offset = delivery.offset,
                committed = partition.committed,
                ack = %ack,
                "Offset settled"
            );
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    fn has_ready(&self, channel: &str) -> bool {
        self.topics
            .lock()
            .get(channel)
            .is_some_and(|t| t.partitions.iter().any(Partition::fetchable))
    }

    async fn remaining(&self, channel: &str) -> CoordinationResult<u64> {
        Ok(self
            .topics
            .lock()
            .get(channel)
            .map_or(0, |t| t.partitions.iter().map(Partition::lag).sum()))
    }

    /// Advance every partition's log start offset, and the group, to the end
    async fn empty(&self, channel: &str) -> CoordinationResult<()> {
        if let Some(topic) = self.topics.lock().get_mut(channel) {
            for partition in &mut topic.partitions {
                let end = partition.end_offset();
                partition.records.clear();
                partition.start_offset = end;
                partition.committed = end;
            }
        }
        Ok(())
    }

    async fn delete(&self, channel: &str) -> CoordinationResult<()> {
        self.topics.lock().remove(channel);
        self.arrivals.notify_waiters();
        Ok(())
    }

    fn arrivals(&self) -> &Notify {
        &self.arrivals
    }
}
