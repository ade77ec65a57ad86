//! Result transport adapters

pub mod broker;
pub mod distributed_queue;
pub mod partitioned_log;
#[cfg(feature = "messaging-rabbitmq")]
pub mod rabbitmq;

pub use broker::BrokerTransport;
pub use distributed_queue::DistributedQueueTransport;
pub use partitioned_log::{LogPosition, PartitionedLogTransport};
#[cfg(feature = "messaging-rabbitmq")]
pub use rabbitmq::{RabbitMqDelivery, RabbitMqTransport};
