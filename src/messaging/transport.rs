//! # Transport Adapters
//!
//! The publish/receive/acknowledge contract is implemented once, here, on top
//! of a small [`ResultTransport`] adapter per backend. Adapters only move
//! bytes and settle deliveries; claim-check diversion, local buffering,
//! consumer workers and NACK-on-close live in the shared code.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::buffer::{BufferedItem, ResultBuffer};
use super::claim_check::ClaimCheck;
use super::message::{
    decode_envelope, decode_result, encode_envelope, encode_result, AckHandle, Acknowledgement,
    ReceivedResult, ResultEnvelope, ResultMessage,
};
use super::traits::{QueryResultsListener, QueryResultsManager, QueryResultsPublisher};
use crate::config::MessagingConfig;
use crate::constants::RESULTS_CHANNEL_PREFIX;
use crate::error::{CoordinationError, CoordinationResult};
use crate::logging::log_channel_operation;

/// Name of the per-query channel (topic, queue) on every backend
pub fn channel_name(query_id: &str) -> String {
    format!("{RESULTS_CHANNEL_PREFIX}{query_id}")
}

/// Byte-level backend adapter.
///
/// `fetch` hands out at most one delivery per call and does not wait for one
/// to arrive; consumers wait on [`arrivals`](Self::arrivals) between polls.
/// Every fetched delivery is settled exactly once. `send` to a channel that
/// does not exist (never created, or deleted) resolves to `Ok(false)`.
pub trait ResultTransport: Send + Sync + 'static {
    /// Backend bookkeeping needed to settle one delivery
    type Delivery: Send + 'static;

    fn backend_name(&self) -> &'static str;

    /// Hard per-message ceiling, if the backend has one
    fn max_message_bytes(&self) -> Option<usize>;

    /// How many unsettled deliveries one consumer worker may hold
    fn max_in_flight(&self) -> usize {
        1
    }

    /// Whether several consumer workers may share one listener
    fn supports_concurrent_consumers(&self) -> bool {
        true
    }

    /// Create the channel if absent
    fn ensure_channel(&self, channel: &str) -> impl Future<Output = CoordinationResult<()>> + Send;

    /// Enqueue, resolving to `Ok(true)` once the backend confirmed it and
    /// `Ok(false)` if that did not happen within `timeout`
    fn send(
        &self,
        channel: &str,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = CoordinationResult<bool>> + Send;

    fn fetch(
        &self,
        channel: &str,
    ) -> impl Future<Output = CoordinationResult<Option<(Vec<u8>, Self::Delivery)>>> + Send;

    fn settle(
        &self,
        channel: &str,
        delivery: Self::Delivery,
        ack: Acknowledgement,
    ) -> impl Future<Output = CoordinationResult<()>> + Send;

    /// Whether a delivery is known to be ready to fetch. Remote backends may
    /// answer from their last observation.
    fn has_ready(&self, channel: &str) -> bool;

    fn remaining(&self, channel: &str) -> impl Future<Output = CoordinationResult<u64>> + Send;

    fn empty(&self, channel: &str) -> impl Future<Output = CoordinationResult<()>> + Send;

    fn delete(&self, channel: &str) -> impl Future<Output = CoordinationResult<()>> + Send;

    /// Signalled whenever something may have become fetchable
    fn arrivals(&self) -> &Notify;
}

/// Channel behaviour shared by every backend
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    /// Consumer workers per listener
    pub concurrency: usize,
    /// Payloads above this many bytes go through the claim check
    pub claim_check_threshold: Option<usize>,
    /// Upper bound on how long an idle worker sleeps between fetches
    pub poll_interval: Duration,
    /// How long a consumer waits for a claim-checked payload
    pub claim_timeout: Duration,
}

impl ChannelSettings {
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1) as usize,
            claim_check_threshold: if config.claim_check.enabled {
                config.claim_check_threshold()
            } else {
                None
            },
            poll_interval: config.partitioned_log.poll_timeout(),
            claim_timeout: config.partitioned_log.poll_timeout(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_config(&MessagingConfig::default())
    }
}

/// [`QueryResultsManager`] over any [`ResultTransport`]
pub struct TransportResultsManager<T: ResultTransport> {
    transport: Arc<T>,
    claim_check: Option<Arc<dyn ClaimCheck>>,
    settings: ChannelSettings,
}

impl<T: ResultTransport> std::fmt::Debug for TransportResultsManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResultsManager")
            .field("backend", &self.transport.backend_name())
            .field("claim_check", &self.claim_check.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl<T: ResultTransport> TransportResultsManager<T> {
    pub fn new(transport: T, claim_check: Option<Arc<dyn ClaimCheck>>, settings: ChannelSettings) -> Self {
        Self {
            transport: Arc::new(transport),
            claim_check,
            settings,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn claim_check(&self) -> Option<&Arc<dyn ClaimCheck>> {
        self.claim_check.as_ref()
    }
}

#[async_trait]
impl<T: ResultTransport> QueryResultsManager for TransportResultsManager<T> {
    fn backend_name(&self) -> &'static str {
        self.transport.backend_name()
    }

    async fn create_publisher(&self, query_id: &str) -> CoordinationResult<Box<dyn QueryResultsPublisher>> {
        let channel = channel_name(query_id);
        self.transport.ensure_channel(&channel).await?;
        log_channel_operation("create_publisher", self.backend_name(), query_id);
        Ok(Box::new(TransportPublisher {
            transport: Arc::clone(&self.transport),
            claim_check: self.claim_check.clone(),
            claim_check_threshold: self.settings.claim_check_threshold,
            query_id: query_id.to_string(),
            channel,
        }))
    }

    async fn create_listener(
        &self,
        listener_id: &str,
        query_id: &str,
    ) -> CoordinationResult<Box<dyn QueryResultsListener>> {
        let channel = channel_name(query_id);
        self.transport.ensure_channel(&channel).await?;

        let workers = if self.transport.supports_concurrent_consumers() {
            self.settings.concurrency
        } else {
            1
        };
        let buffer = Arc::new(ResultBuffer::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = (0..workers)
            .map(|worker| {
                let consumer = Consumer {
                    transport: Arc::clone(&self.transport),
                    claim_check: self.claim_check.clone(),
                    buffer: Arc::clone(&buffer),
                    query_id: query_id.to_string(),
                    channel: channel.clone(),
                    poll_interval: self.settings.poll_interval,
                    claim_timeout: self.settings.claim_timeout,
                };
                let stop = stop_rx.clone();
                debug!(listener_id = listener_id, worker = worker, "Starting result consumer");
                tokio::spawn(consumer.run(stop))
            })
            .collect();

        log_channel_operation("create_listener", self.backend_name(), query_id);
        Ok(Box::new(TransportListener {
            listener_id: listener_id.to_string(),
            query_id: query_id.to_string(),
            channel,
            transport: Arc::clone(&self.transport),
            buffer,
            stop: stop_tx,
            workers: Mutex::new(handles),
            closed: AtomicBool::new(false),
        }))
    }

    async fn delete_query(&self, query_id: &str) -> CoordinationResult<()> {
        self.transport.delete(&channel_name(query_id)).await?;
        if let Some(claim_check) = &self.claim_check {
            claim_check.delete(query_id).await?;
        }
        log_channel_operation("delete_query", self.backend_name(), query_id);
        Ok(())
    }

    async fn empty_query(&self, query_id: &str) -> CoordinationResult<()> {
        self.transport.empty(&channel_name(query_id)).await?;
        if let Some(claim_check) = &self.claim_check {
            claim_check.empty(query_id).await?;
        }
        log_channel_operation("empty_query", self.backend_name(), query_id);
        Ok(())
    }

    async fn num_results_remaining(&self, query_id: &str) -> CoordinationResult<u64> {
        self.transport.remaining(&channel_name(query_id)).await
    }
}

struct TransportPublisher<T: ResultTransport> {
    transport: Arc<T>,
    claim_check: Option<Arc<dyn ClaimCheck>>,
    claim_check_threshold: Option<usize>,
    query_id: String,
    channel: String,
}

#[async_trait]
impl<T: ResultTransport> QueryResultsPublisher for TransportPublisher<T> {
    async fn publish(&self, result: ResultMessage, timeout: Duration) -> CoordinationResult<bool> {
        let bytes = encode_result(&result)?;
        let size = bytes.len();
        let hard_limit = self.transport.max_message_bytes();
        let over_limit = hard_limit.is_some_and(|limit| size > limit);
        let over_threshold = self.claim_check_threshold.is_some_and(|t| size > t);

        let (bytes, claim_checked) = match &self.claim_check {
            Some(claim_check) if over_limit || over_threshold => {
                claim_check.check(&self.query_id, &result.id, bytes).await?;
                (encode_envelope(&ResultEnvelope::pointer(&result.id))?, true)
            }
            None if over_limit => {
                let limit = hard_limit.unwrap_or_default();
                error!(
                    query_id = %self.query_id,
                    result_id = %result.id,
                    size_bytes = size,
                    limit_bytes = limit,
                    backend = self.transport.backend_name(),
                    "❌ Result exceeds transport limit and no claim check is configured"
                );
                return Err(CoordinationError::oversized_payload(size, limit));
            }
            _ => (bytes, false),
        };

        let sent = match self.transport.send(&self.channel, bytes, timeout).await {
            Ok(sent) => sent,
            Err(e) => {
                if claim_checked {
                    self.retract(&result.id);
                }
                return Err(e);
            }
        };
        if !sent {
            warn!(
                query_id = %self.query_id,
                result_id = %result.id,
                timeout_ms = timeout.as_millis() as u64,
                "Result publish not confirmed"
            );
            if claim_checked {
                self.retract(&result.id);
            }
        }
        Ok(sent)
    }

    fn query_id(&self) -> &str {
        &self.query_id
    }
}

impl<T: ResultTransport> TransportPublisher<T> {
    /// Withdraw the claim-checked payload of an undelivered pointer
    fn retract(&self, result_id: &str) {
        if let Some(claim_check) = &self.claim_check {
            claim_check.retract(&self.query_id, result_id);
        }
    }
}

struct TransportListener<T: ResultTransport> {
    listener_id: String,
    query_id: String,
    channel: String,
    transport: Arc<T>,
    buffer: Arc<ResultBuffer>,
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl<T: ResultTransport> QueryResultsListener for TransportListener<T> {
    fn listener_id(&self) -> &str {
        &self.listener_id
    }

    fn query_id(&self) -> &str {
        &self.query_id
    }

    async fn receive(&self, timeout: Duration) -> CoordinationResult<Option<ReceivedResult>> {
        self.buffer.pop(timeout).await
    }

    fn has_results(&self) -> bool {
        !self.buffer.is_closed()
            && (!self.buffer.is_empty() || self.transport.has_ready(&self.channel))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let nacked = self.buffer.close();
        let _ = self.stop.send(true);

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(listener_id = %self.listener_id, error = %e, "Result consumer ended abnormally");
            }
        }
        info!(
            listener_id = %self.listener_id,
            query_id = %self.query_id,
            nacked = nacked,
            "🔌 Result listener closed"
        );
    }
}

impl<T: ResultTransport> Drop for TransportListener<T> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.buffer.close();
            let _ = self.stop.send(true);
        }
    }
}

struct Outstanding<D> {
    /// `None` once already settled (poison messages)
    delivery: Option<D>,
    /// Claim-checked result id and payload, restored if the result is
    /// redelivered
    claimed: Option<(String, Vec<u8>)>,
}

/// One consumer worker: fetch, hand to the buffer, wait for the verdict,
/// settle.
struct Consumer<T: ResultTransport> {
    transport: Arc<T>,
    claim_check: Option<Arc<dyn ClaimCheck>>,
    buffer: Arc<ResultBuffer>,
    query_id: String,
    channel: String,
    poll_interval: Duration,
    claim_timeout: Duration,
}

impl<T: ResultTransport> Consumer<T> {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let max_in_flight = self.transport.max_in_flight().max(1);
        let mut outstanding: HashMap<u64, Outstanding<T::Delivery>> = HashMap::new();
        let mut verdicts = FuturesUnordered::new();
        let mut next_seq: u64 = 0;

        loop {
            if *stop.borrow() {
                break;
            }

            let arrivals = self.transport.arrivals().notified();
            tokio::pin!(arrivals);
            arrivals.as_mut().enable();

            let has_capacity = outstanding.len() < max_in_flight;
            if has_capacity {
                match self.transport.fetch(&self.channel).await {
                    Ok(Some((bytes, delivery))) => {
                        let seq = next_seq;
                        next_seq += 1;
                        let (handle, verdict) = AckHandle::new();
                        let entry = self.deliver(bytes, delivery, handle).await;
                        outstanding.insert(seq, entry);
                        verdicts.push(async move {
                            (seq, verdict.await.unwrap_or(Acknowledgement::Nack))
                        });
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(channel = %self.channel, error = %e, "Result fetch failed");
                    }
                }
            }

            tokio::select! {
                _ = stop.changed() => break,
                Some((seq, ack)) = verdicts.next(), if !verdicts.is_empty() => {
                    if let Some(entry) = outstanding.remove(&seq) {
                        self.settle(entry, ack).await;
                    }
                }
                _ = arrivals.as_mut(), if has_capacity => {}
                _ = tokio::time::sleep(self.poll_interval), if has_capacity => {}
            }
        }

        // Verdicts already given are honoured; everything else is NACKed
        while let Some(Some((seq, ack))) = verdicts.next().now_or_never() {
            if let Some(entry) = outstanding.remove(&seq) {
                self.settle(entry, ack).await;
            }
        }
        for (_, entry) in outstanding.drain() {
            self.settle(entry, Acknowledgement::Nack).await;
        }
    }

    /// Decode a delivery and hand it to the caller. Undecodable deliveries are
    /// NACKed straight away and surface as an error.
    async fn deliver(&self, bytes: Vec<u8>, delivery: T::Delivery, handle: AckHandle) -> Outstanding<T::Delivery> {
        match self.decode(&bytes).await {
            Ok((message, claimed)) => {
                let item = BufferedItem::Result(ReceivedResult::new(message, handle));
                // A refused item drops its handle, which NACKs it
                let _ = self.buffer.push(item);
                Outstanding {
                    delivery: Some(delivery),
                    claimed,
                }
            }
            Err(e) => {
                warn!(
                    channel = %self.channel,
                    backend = self.transport.backend_name(),
                    error = %e,
                    "⚠️ Unable to decode result, NACKing"
                );
                if let Err(settle_error) = self
                    .transport
                    .settle(&self.channel, delivery, Acknowledgement::Nack)
                    .await
                {
                    warn!(channel = %self.channel, error = %settle_error, "Could not NACK undecodable result");
                }
                let _ = self.buffer.push(BufferedItem::Poison(e, handle));
                Outstanding {
                    delivery: None,
                    claimed: None,
                }
            }
        }
    }

    async fn decode(&self, bytes: &[u8]) -> CoordinationResult<(ResultMessage, Option<(String, Vec<u8>)>)> {
        let envelope = decode_envelope(bytes)?;
        if !envelope.claim_check {
            return Ok((
                ResultMessage {
                    id: envelope.id,
                    payload: envelope.payload,
                },
                None,
            ));
        }

        let claim_check = self.claim_check.as_ref().ok_or_else(|| {
            CoordinationError::configuration(
                "messaging.claim_check",
                format!("result {} is claim-checked but no claim check is configured", envelope.id),
            )
        })?;
        let claimed = claim_check
            .claim(&self.query_id, &envelope.id, self.claim_timeout)
            .await?
            .ok_or_else(|| {
                CoordinationError::transport(
                    "claim_check",
                    "claim",
                    format!("no stored payload for result {}", envelope.id),
                )
            })?;
        match decode_result(&claimed) {
            Ok(message) => Ok((message, Some((envelope.id, claimed)))),
            Err(e) => {
                claim_check.restore(&self.query_id, &envelope.id, claimed);
                Err(e)
            }
        }
    }

    async fn settle(&self, entry: Outstanding<T::Delivery>, ack: Acknowledgement) {
        if let Some(delivery) = entry.delivery {
            if ack == Acknowledgement::Nack {
                if let (Some(claim_check), Some((result_id, payload))) = (&self.claim_check, entry.claimed) {
                    claim_check.restore(&self.query_id, &result_id, payload);
                }
            }
            debug!(channel = %self.channel, ack = %ack, "Settling result delivery");
            if let Err(e) = self.transport.settle(&self.channel, delivery, ack).await {
                error!(channel = %self.channel, ack = %ack, error = %e, "❌ Could not settle result delivery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name("abc"), "queryResults.abc");
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = MessagingConfig::default();
        config.concurrency = 3;
        config.claim_check.threshold_bytes = Some(128);
        let settings = ChannelSettings::from_config(&config);
        assert_eq!(settings.concurrency, 3);
        assert_eq!(settings.claim_check_threshold, Some(128));

        config.claim_check.enabled = false;
        assert_eq!(ChannelSettings::from_config(&config).claim_check_threshold, None);
    }

    /// Accepts channels but fails every send
    #[derive(Default)]
    struct FailingSendTransport {
        arrivals: Notify,
    }

    impl ResultTransport for FailingSendTransport {
        type Delivery = ();

        fn backend_name(&self) -> &'static str {
            "failing_send"
        }

        fn max_message_bytes(&self) -> Option<usize> {
            Some(64)
        }

        async fn ensure_channel(&self, _channel: &str) -> CoordinationResult<()> {
            Ok(())
        }

        async fn send(&self, _channel: &str, _bytes: Vec<u8>, _timeout: Duration) -> CoordinationResult<bool> {
            Err(CoordinationError::transport("failing_send", "send", "connection reset"))
        }

        async fn fetch(&self, _channel: &str) -> CoordinationResult<Option<(Vec<u8>, ())>> {
            Ok(None)
        }

        async fn settle(&self, _channel: &str, _delivery: (), _ack: Acknowledgement) -> CoordinationResult<()> {
            Ok(())
        }

        fn has_ready(&self, _channel: &str) -> bool {
            false
        }

        async fn remaining(&self, _channel: &str) -> CoordinationResult<u64> {
            Ok(0)
        }

        async fn empty(&self, _channel: &str) -> CoordinationResult<()> {
            Ok(())
        }

        async fn delete(&self, _channel: &str) -> CoordinationResult<()> {
            Ok(())
        }

        fn arrivals(&self) -> &Notify {
            &self.arrivals
        }
    }

    #[tokio::test]
    async fn test_failed_send_withdraws_checked_payload() {
        let claim_check = Arc::new(crate::messaging::InMemoryClaimCheck::new());
        claim_check.check("q", "earlier", b"kept".to_vec()).await.unwrap();
        let manager = TransportResultsManager::new(
            FailingSendTransport::default(),
            Some(claim_check.clone() as Arc<dyn ClaimCheck>),
            ChannelSettings::default(),
        );

        let publisher = manager.create_publisher("q").await.unwrap();
        let large = ResultMessage::new("large", serde_json::json!("x".repeat(200)));
        let err = publisher.publish(large, Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_retryable());

        assert_eq!(claim_check.pending("q"), 1);
        assert_eq!(
            claim_check.claim("q", "earlier", Duration::ZERO).await.unwrap(),
            Some(b"kept".to_vec())
        );
    }
}
