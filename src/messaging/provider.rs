//! Messaging provider
//!
//! Enum dispatch over the result backends, selected from
//! [`MessagingConfig`]. The broker backend runs on RabbitMQ when a broker
//! url is configured (`messaging-rabbitmq` feature), and in process
//! otherwise.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::backends::{BrokerTransport, DistributedQueueTransport, PartitionedLogTransport};
#[cfg(feature = "messaging-rabbitmq")]
use super::backends::RabbitMqTransport;
use super::claim_check::{ClaimCheck, InMemoryClaimCheck};
use super::traits::{QueryResultsListener, QueryResultsManager, QueryResultsPublisher};
use super::transport::{ChannelSettings, TransportResultsManager};
use crate::config::{MessagingBackend, MessagingConfig};
use crate::error::CoordinationResult;

#[derive(Debug)]
pub enum MessagingProvider {
    PartitionedLog(TransportResultsManager<PartitionedLogTransport>),
    Broker(TransportResultsManager<BrokerTransport>),
    DistributedQueue(TransportResultsManager<DistributedQueueTransport>),
    #[cfg(feature = "messaging-rabbitmq")]
    RabbitMq(Box<TransportResultsManager<RabbitMqTransport>>),
}

impl MessagingProvider {
    /// Build the configured backend, connecting to RabbitMQ when the broker
    /// backend has a url
    pub async fn connect(config: &MessagingConfig) -> CoordinationResult<Self> {
        let url = match (config.backend, config.broker.url.as_deref()) {
            (MessagingBackend::Broker, Some(url)) => url,
            _ => return Ok(Self::from_config(config)),
        };

        #[cfg(feature = "messaging-rabbitmq")]
        {
            let transport = RabbitMqTransport::connect(url, config.broker.clone()).await?;
            let provider = Self::RabbitMq(Box::new(TransportResultsManager::new(
                transport,
                default_claim_check(config),
                ChannelSettings::from_config(config),
            )));
            info!(
                backend = provider.backend_name(),
                claim_check = config.claim_check.enabled,
                concurrency = config.concurrency,
                "📬 Messaging provider initialized"
            );
            Ok(provider)
        }
        #[cfg(not(feature = "messaging-rabbitmq"))]
        {
            let _ = url;
            Err(crate::error::CoordinationError::configuration(
                "messaging.broker.url",
                "a RabbitMQ broker requires the `messaging-rabbitmq` feature",
            ))
        }
    }

    /// Build the configured backend with an in-process claim check
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self::with_claim_check(config, default_claim_check(config))
    }

    /// Build the configured backend around a caller-supplied claim check
    pub fn with_claim_check(config: &MessagingConfig, claim_check: Option<Arc<dyn ClaimCheck>>) -> Self {
        let settings = ChannelSettings::from_config(config);
        let provider = match config.backend {
            MessagingBackend::PartitionedLog => Self::PartitionedLog(TransportResultsManager::new(
                PartitionedLogTransport::new(config.partitioned_log.clone()),
                claim_check,
                settings,
            )),
            MessagingBackend::Broker => Self::Broker(TransportResultsManager::new(
                BrokerTransport::new(config.broker.clone()),
                claim_check,
                settings,
            )),
            MessagingBackend::DistributedQueue => Self::DistributedQueue(TransportResultsManager::new(
                DistributedQueueTransport::new(),
                claim_check,
                settings,
            )),
        };
        info!(
            backend = provider.backend_name(),
            claim_check = config.claim_check.enabled,
            concurrency = config.concurrency,
            "📬 Messaging provider initialized"
        );
        provider
    }

    fn manager(&self) -> &dyn QueryResultsManager {
        match self {
            Self::PartitionedLog(m) => m,
            Self::Broker(m) => m,
            Self::DistributedQueue(m) => m,
            #[cfg(feature = "messaging-rabbitmq")]
            Self::RabbitMq(m) => &**m,
        }
    }
}

fn default_claim_check(config: &MessagingConfig) -> Option<Arc<dyn ClaimCheck>> {
    if config.claim_check.enabled {
        Some(Arc::new(InMemoryClaimCheck::new()))
    } else {
        None
    }
}

#[async_trait]
impl QueryResultsManager for MessagingProvider {
    fn backend_name(&self) -> &'static str {
        self.manager().backend_name()
    }

    async fn create_publisher(&self, query_id: &str) -> CoordinationResult<Box<dyn QueryResultsPublisher>> {
        self.manager().create_publisher(query_id).await
    }

    async fn create_listener(
        &self,
        listener_id: &str,
        query_id: &str,
    ) -> CoordinationResult<Box<dyn QueryResultsListener>> {
        self.manager().create_listener(listener_id, query_id).await
    }

    async fn delete_query(&self, query_id: &str) -> CoordinationResult<()> {
        self.manager().delete_query(query_id).await
    }

    async fn empty_query(&self, query_id: &str) -> CoordinationResult<()> {
        self.manager().empty_query(query_id).await
    }

    async fn num_results_remaining(&self, query_id: &str) -> CoordinationResult<u64> {
        self.manager().num_results_remaining(query_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_selection() {
        let mut config = MessagingConfig::default();
        assert_eq!(MessagingProvider::from_config(&config).backend_name(), "partitioned_log");

        config.backend = MessagingBackend::Broker;
        assert_eq!(MessagingProvider::from_config(&config).backend_name(), "broker");

        config.backend = MessagingBackend::DistributedQueue;
        assert_eq!(
            MessagingProvider::from_config(&config).backend_name(),
            "distributed_queue"
        );
    }

    #[tokio::test]
    async fn test_connect_without_url_stays_in_process() {
        let mut config = MessagingConfig::default();
        config.backend = MessagingBackend::Broker;
        let provider = MessagingProvider::connect(&config).await.unwrap();
        assert!(matches!(provider, MessagingProvider::Broker(_)));

        // a url only selects RabbitMQ for the broker backend
        config.backend = MessagingBackend::DistributedQueue;
        config.broker.url = Some("amqp://localhost:5672/%2F".to_string());
        let provider = MessagingProvider::connect(&config).await.unwrap();
        assert_eq!(provider.backend_name(), "distributed_queue");
    }

    #[cfg(not(feature = "messaging-rabbitmq"))]
    #[tokio::test]
    async fn test_broker_url_requires_feature() {
        let mut config = MessagingConfig::default();
        config.backend = MessagingBackend::Broker;
        config.broker.url = Some("amqp://localhost:5672/%2F".to_string());
        let error = MessagingProvider::connect(&config).await.unwrap_err();
        assert!(error.is_fatal());
    }
}
