//! # RabbitMQ Backend
//!
//! Queue-per-query results over AMQP 0.9.1 using `lapin`. Each result queue
//! gets a dead letter exchange and queue, so rejected results are kept
//! aside rather than dropped:
//!
//! - ACK acknowledges the delivery
//! - NACK requeues it
//! - Reject dead-letters it to `{queue}_dlq`
//!
//! Publishing is mandatory and confirmed: `send` reports `true` only when the
//! broker acknowledged a message it could route. A message for a queue that
//! does not exist comes back as returned and is reported unconfirmed.
//!
//! Existence checks use passive declares on a short-lived channel, since a
//! failed passive declare closes the channel it ran on.

use dashmap::DashMap;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::messaging::message::Acknowledgement;
use crate::messaging::transport::ResultTransport;

const BACKEND: &str = "rabbitmq";
const CONNECTION_NAME: &str = "query-coordinator-results";

fn dead_letter_exchange(queue: &str) -> String {
    format!("{queue}_dlx")
}

fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}_dlq")
}

fn amqp_error(operation: &str, error: lapin::Error) -> CoordinationError {
    CoordinationError::transport(BACKEND, operation, error.to_string())
}

fn is_not_found(error: &lapin::Error) -> bool {
    let message = error.to_string();
    message.contains("NOT_FOUND") || message.contains("404")
}

/// A fetched message, settled on the channel that delivered it
#[derive(Debug)]
pub struct RabbitMqDelivery {
    channel: Channel,
    delivery_tag: u64,
}

#[derive(Debug)]
pub struct RabbitMqTransport {
    config: BrokerConfig,
    connection: Connection,
    channel: RwLock<Channel>,
    /// Messages known ready per queue, from the last fetch plus local sends
    ready: DashMap<String, u64>,
    /// Deliveries fetched by this process and not yet settled
    unacked: DashMap<String, u64>,
    arrivals: Notify,
}

impl RabbitMqTransport {
    pub async fn connect(url: &str, config: BrokerConfig) -> CoordinationResult<Self> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into()),
        )
        .await
        .map_err(|e| amqp_error("connect", e))?;
        let channel = open_channel(&connection, &config).await?;

        info!(
            durable = config.durable,
            prefetch = config.prefetch,
            "🐇 Connected to RabbitMQ"
        );
        Ok(Self {
            config,
            connection,
            channel: RwLock::new(channel),
            ready: DashMap::new(),
            unacked: DashMap::new(),
            arrivals: Notify::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Messages rejected by consumers, or `None` if the queue does not exist
    pub async fn dead_letter_count(&self, queue: &str) -> CoordinationResult<Option<u64>> {
        self.ready_count(&dead_letter_queue(queue)).await
    }

    /// The shared channel, reopened if the broker closed it
    async fn channel(&self) -> CoordinationResult<Channel> {
        {
            let channel = self.channel.read().await;
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        let mut channel = self.channel.write().await;
        if !channel.status().connected() {
            warn!("RabbitMQ channel closed, reopening");
            *channel = open_channel(&self.connection, &self.config).await?;
        }
        Ok(channel.clone())
    }

    fn queue_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.config.durable,
            ..Default::default()
        }
    }

    fn delivery_mode(&self) -> u8 {
        if self.config.durable {
            2
        } else {
            1
        }
    }

    async fn setup_dead_letters(&self, channel: &Channel, queue: &str) -> CoordinationResult<()> {
        let exchange = dead_letter_exchange(queue);
        let dlq = dead_letter_queue(queue);
        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: self.config.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_error("exchange_declare", e))?;
        channel
            .queue_declare(&dlq, self.queue_options(), FieldTable::default())
            .await
            .map_err(|e| amqp_error("queue_declare", e))?;
        channel
            .queue_bind(&dlq, &exchange, queue, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| amqp_error("queue_bind", e))?;
        Ok(())
    }

    /// Ready messages in a queue, or `None` if it does not exist
    async fn ready_count(&self, queue: &str) -> CoordinationResult<Option<u64>> {
        let scratch = self
            .connection
            .create_channel()
            .await
            .map_err(|e| amqp_error("create_channel", e))?;
        let declared = scratch
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        match declared {
            Ok(state) => {
                if let Err(e) = scratch.close(200, "OK").await {
                    debug!(queue = queue, error = %e, "Scratch channel close failed");
                }
                Ok(Some(u64::from(state.message_count())))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(amqp_error("queue_declare", e)),
        }
    }

    fn adjust(counts: &DashMap<String, u64>, queue: &str, delta: i64) {
        let mut count = counts.entry(queue.to_string()).or_insert(0);
        *count = count.saturating_add_signed(delta);
    }
}

async fn open_channel(connection: &Connection, config: &BrokerConfig) -> CoordinationResult<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| amqp_error("create_channel", e))?;
    channel
        .basic_qos(config.prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| amqp_error("basic_qos", e))?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| amqp_error("confirm_select", e))?;
    Ok(channel)
}

impl ResultTransport for RabbitMqTransport {
    type Delivery = RabbitMqDelivery;

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn max_message_bytes(&self) -> Option<usize> {
        Some(self.config.effective_max_message_size())
    }

    fn max_in_flight(&self) -> usize {
        self.config.prefetch.max(1) as usize
    }

    async fn ensure_channel(&self, queue: &str) -> CoordinationResult<()> {
        let channel = self.channel().await?;
        self.setup_dead_letters(&channel, queue).await?;

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dead_letter_exchange(queue).into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(queue.into()),
        );
        let state = channel
            .queue_declare(queue, self.queue_options(), args)
            .await
            .map_err(|e| amqp_error("queue_declare", e))?;
        self.ready.insert(queue.to_string(), u64::from(state.message_count()));
        debug!(queue = queue, durable = self.config.durable, "Declared result queue");
        Ok(())
    }

    async fn send(&self, queue: &str, bytes: Vec<u8>, timeout: Duration) -> CoordinationResult<bool> {
        let limit = self.config.effective_max_message_size();
        if bytes.len() > limit {
            return Err(CoordinationError::transport(
                BACKEND,
                "publish",
                format!("message of {} bytes exceeds max message size {limit}", bytes.len()),
            ));
        }

        let channel = self.channel().await?;
        let published = tokio::time::timeout(timeout, async {
            let confirm = channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions {
                        mandatory: true,
                        ..Default::default()
                    },
                    &bytes,
                    BasicProperties::default().with_delivery_mode(self.delivery_mode()),
                )
                .await
                .map_err(|e| amqp_error("publish", e))?;
            confirm.await.map_err(|e| amqp_error("publish_confirm", e))
        })
        .await;

        let confirmed = match published {
            Err(_) => {
                warn!(queue = queue, timeout_ms = timeout.as_millis() as u64, "Publish confirm timed out");
                false
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(Confirmation::Ack(None))) | Ok(Ok(Confirmation::NotRequested)) => true,
            Ok(Ok(Confirmation::Ack(Some(_)))) => {
                warn!(queue = queue, "Publish not confirmed: queue does not exist");
                false
            }
            Ok(Ok(Confirmation::Nack(_))) => {
                warn!(queue = queue, "Publish NACKed by broker");
                false
            }
        };
        if confirmed {
            Self::adjust(&self.ready, queue, 1);
            self.arrivals.notify_waiters();
        }
        Ok(confirmed)
    }

    async fn fetch(&self, queue: &str) -> CoordinationResult<Option<(Vec<u8>, RabbitMqDelivery)>> {
        let channel = self.channel().await?;
        let message = match channel.basic_get(queue, BasicGetOptions { no_ack: false }).await {
            Ok(message) => message,
            Err(e) if is_not_found(&e) => {
                self.ready.remove(queue);
                return Ok(None);
            }
            Err(e) => return Err(amqp_error("basic_get", e)),
        };
        let Some(message) = message else {
            self.ready.insert(queue.to_string(), 0);
            return Ok(None);
        };

        self.ready.insert(queue.to_string(), u64::from(message.message_count));
        Self::adjust(&self.unacked, queue, 1);
        let delivery = RabbitMqDelivery {
            channel,
            delivery_tag: message.delivery.delivery_tag,
        };
        Ok(Some((message.delivery.data, delivery)))
    }

    async fn settle(&self, queue: &str, delivery: RabbitMqDelivery, ack: Acknowledgement) -> CoordinationResult<()> {
        Self::adjust(&self.unacked, queue, -1);
        if !delivery.channel.status().connected() {
            // The broker requeued everything unacknowledged on that channel
            debug!(queue = queue, ack = %ack, "Delivery channel closed, nothing to settle");
            return Ok(());
        }

        let tag = delivery.delivery_tag;
        let settled = match ack {
            Acknowledgement::Ack => delivery.channel.basic_ack(tag, BasicAckOptions::default()).await,
            Acknowledgement::Nack => {
                delivery
                    .channel
                    .basic_nack(
                        tag,
                        BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        },
                    )
                    .await
            }
            Acknowledgement::Reject => {
                delivery
                    .channel
                    .basic_reject(tag, BasicRejectOptions { requeue: false })
                    .await
            }
        };
        settled.map_err(|e| amqp_error("settle", e))?;

        if ack == Acknowledgement::Nack {
            Self::adjust(&self.ready, queue, 1);
            self.arrivals.notify_waiters();
        }
        Ok(())
    }

    fn has_ready(&self, queue: &str) -> bool {
        self.ready.get(queue).is_some_and(|count| *count > 0)
    }

    /// Ready messages on the broker plus deliveries this process holds
    async fn remaining(&self, queue: &str) -> CoordinationResult<u64> {
        let ready = self.ready_count(queue).await?.unwrap_or(0);
        let unacked = self.unacked.get(queue).map_or(0, |count| *count);
        Ok(ready + unacked)
    }

    /// Purge ready messages; unacknowledged deliveries are unaffected
    async fn empty(&self, queue: &str) -> CoordinationResult<()> {
        if self.ready_count(queue).await?.is_none() {
            return Ok(());
        }
        let purged = self
            .channel()
            .await?
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| amqp_error("queue_purge", e))?;
        self.ready.insert(queue.to_string(), 0);
        debug!(queue = queue, purged = purged, "Purged result queue");
        Ok(())
    }

    async fn delete(&self, queue: &str) -> CoordinationResult<()> {
        let channel = self.channel().await?;
        for name in [queue.to_string(), dead_letter_queue(queue)] {
            channel
                .queue_delete(&name, QueueDeleteOptions::default())
                .await
                .map_err(|e| amqp_error("queue_delete", e))?;
        }
        channel
            .exchange_delete(&dead_letter_exchange(queue), ExchangeDeleteOptions::default())
            .await
            .map_err(|e| amqp_error("exchange_delete", e))?;
        self.ready.remove(queue);
        self.unacked.remove(queue);
        self.arrivals.notify_waiters();
        Ok(())
    }

    fn arrivals(&self) -> &Notify {
        &self.arrivals
    }
}
