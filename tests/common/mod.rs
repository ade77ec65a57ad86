//! Shared fixtures for integration tests

#![allow(dead_code)]

pub mod strategies;

use std::sync::Arc;

use query_coordinator::config::{CoordinatorConfig, MessagingBackend, MessagingConfig};
use query_coordinator::coordination::QueryCoordinator;
use query_coordinator::messaging::MessagingProvider;
use query_coordinator::models::{QueryCheckpoint, QueryKey};
use query_coordinator::storage::QueryStorageCache;
use uuid::Uuid;

pub const ALL_BACKENDS: [MessagingBackend; 3] = [
    MessagingBackend::PartitionedLog,
    MessagingBackend::Broker,
    MessagingBackend::DistributedQueue,
];

/// In-process coordinator with short lock waits
pub fn coordinator(max_running: u32, next_calls: u32) -> Arc<QueryCoordinator> {
    let mut config = CoordinatorConfig::default();
    config.tasks.max_running = max_running;
    config.next_call.concurrency = next_calls;
    config.lock.wait_time_ms = 2_000;
    config.lock.lease_time_ms = 5_000;
    Arc::new(QueryCoordinator::new(
        Arc::new(QueryStorageCache::in_memory()),
        Arc::new(MessagingProvider::from_config(&config.messaging)),
        &config,
    ))
}

pub fn checkpoint(query_id: Uuid) -> QueryCheckpoint {
    QueryCheckpoint::new(QueryKey::new("default", query_id, "EventQuery"))
}

/// Messaging configuration for `backend` with a fast poll loop
pub fn messaging_config(backend: MessagingBackend) -> MessagingConfig {
    let mut config = MessagingConfig::default();
    config.backend = backend;
    config.partitioned_log.poll_timeout_ms = 20;
    config
}
