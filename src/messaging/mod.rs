//! # Result Delivery
//!
//! Per-query result channels: a publisher and any number of listeners over
//! one logical channel, with explicit ACK/NACK/Reject per result and a claim
//! check for payloads too large for the transport.
//!
//! ```rust,no_run
//! use query_coordinator::config::MessagingConfig;
//! use query_coordinator::messaging::{MessagingProvider, QueryResultsManager, ResultMessage};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let results = MessagingProvider::from_config(&MessagingConfig::default());
//!
//! let publisher = results.create_publisher("query-1").await?;
//! publisher
//!     .publish(ResultMessage::new("page-1", serde_json::json!([1, 2, 3])), Duration::from_secs(1))
//!     .await?;
//!
//! let listener = results.create_listener("listener-a", "query-1").await?;
//! if let Some(result) = listener.receive(Duration::from_secs(1)).await? {
//!     let page = result.ack();
//! }
//! listener.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backends;
mod buffer;
pub mod claim_check;
pub mod message;
pub mod provider;
pub mod traits;
pub mod transport;

pub use backends::{BrokerTransport, DistributedQueueTransport, PartitionedLogTransport};
#[cfg(feature = "messaging-rabbitmq")]
pub use backends::RabbitMqTransport;
pub use claim_check::{ClaimCheck, InMemoryClaimCheck};
pub use message::{AckHandle, Acknowledgement, ReceivedResult, ResultMessage};
pub use provider::MessagingProvider;
pub use traits::{QueryResultsListener, QueryResultsManager, QueryResultsPublisher};
pub use transport::{channel_name, ChannelSettings, ResultTransport, TransportResultsManager};
