//! # Distributed Queue Backend
//!
//! Embedded in-memory queue per query with at-most-once delivery: a fetch
//! removes the item. A NACK offers it back at the head of the queue; ACK and
//! Reject both leave it removed. One consumer per listener. Queues are only
//! created by `ensure_channel`; items sent to a missing queue are dropped
//! unconfirmed.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::CoordinationResult;
use crate::messaging::message::Acknowledgement;
use crate::messaging::transport::ResultTransport;

#[derive(Debug, Default)]
pub struct DistributedQueueTransport {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    arrivals: Notify,
}

impl DistributedQueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.queues.lock().contains_key(queue)
    }
}

impl ResultTransport for DistributedQueueTransport {
    /// The removed item, kept for a possible re-offer
    type Delivery = Vec<u8>;

    fn backend_name(&self) -> &'static str {
        "distributed_queue"
    }

    fn max_message_bytes(&self) -> Option<usize> {
        None
    }

    fn supports_concurrent_consumers(&self) -> bool {
        false
    }

    async fn ensure_channel(&self, channel: &str) -> CoordinationResult<()> {
        self.queues.lock().entry(channel.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, channel: &str, bytes: Vec<u8>, _timeout: Duration) -> CoordinationResult<bool> {
        match self.queues.lock().get_mut(channel) {
            Some(queue) => queue.push_back(bytes),
            None => {
                warn!(queue = channel, "Item not offered: queue does not exist");
                return Ok(false);
            }
        }
        self.arrivals.notify_waiters();
        Ok(true)
    }

    async fn fetch(&self, channel: &str) -> CoordinationResult<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .queues
            .lock()
            .get_mut(channel)
            .and_then(VecDeque::pop_front)
            .map(|item| (item.clone(), item)))
    }

    async fn settle(&self, channel: &str, delivery: Vec<u8>, ack: Acknowledgement) -> CoordinationResult<()> {
        if ack != Acknowledgement::Nack {
            return Ok(());
        }
        if let Some(queue) = self.queues.lock().get_mut(channel) {
            queue.push_front(delivery);
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    fn has_ready(&self, channel: &str) -> bool {
        self.queues
            .lock()
            .get(channel)
            .is_some_and(|q| !q.is_empty())
    }

    async fn remaining(&self, channel: &str) -> CoordinationResult<u64> {
        Ok(self.queues.lock().get(channel).map_or(0, |q| q.len() as u64))
    }

    async fn empty(&self, channel: &str) -> CoordinationResult<()> {
        if let Some(queue) = self.queues.lock().get_mut(channel) {
            queue.clear();
        }
        Ok(())
    }

    async fn delete(&self, channel: &str) -> CoordinationResult<()> {
        self.queues.lock().remove(channel);
        Ok(())
    }

    fn arrivals(&self) -> &Notify {
        &self.arrivals
    }
}
