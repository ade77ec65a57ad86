//! # Result Delivery Traits
//!
//! Backend-agnostic contract for per-query result channels. Every backend
//! satisfies the same publish/receive/acknowledge semantics; callers never see
//! which one is in use.

use async_trait::async_trait;
use std::time::Duration;

use super::message::{ReceivedResult, ResultMessage};
use crate::error::CoordinationResult;

/// Producer side of a query's result channel
#[async_trait]
pub trait QueryResultsPublisher: Send + Sync {
    /// Publish a result, blocking up to `timeout`.
    ///
    /// `Ok(true)` once the transport confirmed the enqueue, `Ok(false)` on
    /// timeout. Payloads above the transport ceiling are diverted to the claim
    /// check; without one they fail with
    /// [`OversizedPayloadWithoutClaimCheck`](crate::error::CoordinationError::OversizedPayloadWithoutClaimCheck).
    async fn publish(&self, result: ResultMessage, timeout: Duration) -> CoordinationResult<bool>;

    fn query_id(&self) -> &str;
}

/// Consumer side of a query's result channel
#[async_trait]
pub trait QueryResultsListener: Send + Sync {
    fn listener_id(&self) -> &str;

    fn query_id(&self) -> &str;

    /// Next result, waiting up to `timeout`. `Ok(None)` on timeout or once
    /// closed. A malformed message is NACKed and surfaces as an error.
    async fn receive(&self, timeout: Duration) -> CoordinationResult<Option<ReceivedResult>>;

    /// Whether a result is available without waiting
    fn has_results(&self) -> bool;

    /// Stop consuming. Results pulled but not yet acknowledged are NACKed
    /// before this returns. Idempotent.
    async fn close(&self);
}

/// Channel lifecycle per query
#[async_trait]
pub trait QueryResultsManager: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Publisher for the query's channel, creating the channel if needed
    async fn create_publisher(&self, query_id: &str) -> CoordinationResult<Box<dyn QueryResultsPublisher>>;

    /// Listener for the query's channel, creating the channel if needed
    async fn create_listener(
        &self,
        listener_id: &str,
        query_id: &str,
    ) -> CoordinationResult<Box<dyn QueryResultsListener>>;

    /// Destroy the channel and its claim-check store
    async fn delete_query(&self, query_id: &str) -> CoordinationResult<()>;

    /// Drop outstanding results, keeping the channel
    async fn empty_query(&self, query_id: &str) -> CoordinationResult<()>;

    /// Best-effort backlog size
    async fn num_results_remaining(&self, query_id: &str) -> CoordinationResult<u64>;
}
