//! # In-Process Broker Backend
//!
//! Queue-per-query broker held in process memory, with the same delivery
//! semantics as the RabbitMQ adapter (`messaging-rabbitmq` feature). Used
//! when no broker URL is configured, and by tests. Per-message
//! acknowledgement: Deliveries carry
//! a delivery tag and stay unacknowledged until settled:
//!
//! - ACK removes the message
//! - NACK requeues it at the head of the queue
//! - Reject moves it to the queue's dead letters
//!
//! Publishing uses publisher confirms: `send` reports `true` only once the
//! message was routed to an existing queue. Consumers may hold up to
//! `prefetch` unacknowledged deliveries each.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::messaging::message::Acknowledgement;
use crate::messaging::transport::ResultTransport;

const BACKEND: &str = "broker";

#[derive(Debug, Default)]
struct BrokerQueue {
    ready: VecDeque<Vec<u8>>,
    unacked: HashMap<u64, Vec<u8>>,
    dead_letters: Vec<Vec<u8>>,
    next_delivery_tag: u64,
}

#[derive(Debug)]
pub struct BrokerTransport {
    config: BrokerConfig,
    queues: Mutex<HashMap<String, BrokerQueue>>,
    arrivals: Notify,
}

impl BrokerTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(HashMap::new()),
            arrivals: Notify::new(),
        }
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.queues.lock().contains_key(queue)
    }

    /// Messages rejected by consumers
    pub fn dead_letter_count(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, |q| q.dead_letters.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, |q| q.unacked.len())
    }
}

impl ResultTransport for BrokerTransport {
    type Delivery = u64;

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn max_message_bytes(&self) -> Option<usize> {
        Some(self.config.effective_max_message_size())
    }

    fn max_in_flight(&self) -> usize {
        self.config.prefetch.max(1) as usize
    }

    async fn ensure_channel(&self, channel: &str) -> CoordinationResult<()> {
        let mut queues = self.queues.lock();
        if !queues.contains_key(channel) {
            debug!(queue = channel, "Declaring result queue");
            queues.insert(channel.to_string(), BrokerQueue::default());
        }
        Ok(())
    }

    async fn send(&self, channel: &str, bytes: Vec<u8>, _timeout: Duration) -> CoordinationResult<bool> {
        let limit = self.config.effective_max_message_size();
        if bytes.len() > limit {
            return Err(CoordinationError::transport(
                BACKEND,
                "publish",
                format!("message of {} bytes exceeds max message size {limit}", bytes.len()),
            ));
        }
        let confirmed = {
            let mut queues = self.queues.lock();
            match queues.get_mut(channel) {
                Some(queue) => {
                    queue.ready.push_back(bytes);
                    true
                }
                None => false,
            }
        };
        if confirmed {
            self.arrivals.notify_waiters();
        } else {
            warn!(queue = channel, "Publish not confirmed: queue does not exist");
        }
        Ok(confirmed)
    }

    async fn fetch(&self, channel: &str) -> CoordinationResult<Option<(Vec<u8>, u64)>> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(channel) else {
            return Ok(None);
        };
        let Some(body) = queue.ready.pop_front() else {
            return Ok(None);
        };
        queue.next_delivery_tag += 1;
        let tag = queue.next_delivery_tag;
        queue.unacked.insert(tag, body.clone());
        Ok(Some((body, tag)))
    }

    async fn settle(&self, channel: &str, delivery: u64, ack: Acknowledgement) -> CoordinationResult<()> {
        {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(channel) else {
                debug!(queue = channel, "Settling delivery of a deleted queue");
                return Ok(());
            };
            let Some(body) = queue.unacked.remove(&delivery) else {
                return Ok(());
            };
            match ack {
                Acknowledgement::Ack => {}
                Acknowledgement::Nack => queue.ready.push_front(body),
                Acknowledgement::Reject => queue.dead_letters.push(body),
            }
        }
        if ack == Acknowledgement::Nack {
            self.arrivals.notify_waiters();
        }
        Ok(())
    }

    fn has_ready(&self, channel: &str) -> bool {
        self.queues
            .lock()
            .get(channel)
            .is_some_and(|q| !q.ready.is_empty())
    }

    async fn remaining(&self, channel: &str) -> CoordinationResult<u64> {
        Ok(self
            .queues
            .lock()
            .get(channel)
            .map_or(0, |q| (q.ready.len() + q.unacked.len()) as u64))
    }

    /// Purge ready messages; unacknowledged deliveries are unaffected
    async fn empty(&self, channel: &str) -> CoordinationResult<()> {
        if let Some(queue) = self.queues.lock().get_mut(channel) {
            queue.ready.clear();
        }
        Ok(())
    }

    async fn delete(&self, channel: &str) -> CoordinationResult<()> {
        self.queues.lock().remove(channel);
        self.arrivals.notify_waiters();
        Ok(())
    }

    fn arrivals(&self) -> &Notify {
        &self.arrivals
    }
}
