//! # Coordinator Configuration
//!
//! Typed configuration tree for the coordinator. Every section carries
//! defaults, so an empty configuration source yields a usable in-process
//! setup.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use query_coordinator::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let lease = manager.config().lock.lease_time();
//! let backend = &manager.config().messaging.backend;
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{defaults, BROKER_MAX_MESSAGE_SIZE_BYTES, LOG_DEFAULT_MAX_MESSAGE_BYTES};
use crate::error::{CoordinationError, CoordinationResult};

pub use loader::ConfigManager;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub lock: LockConfig,
    pub next_call: NextCallConfig,
    pub tasks: TasksConfig,
    pub storage: StorageConfig,
    pub messaging: MessagingConfig,
}

/// Distributed lock timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long to block waiting for a lock
    pub wait_time_ms: u64,
    /// How long a lock survives a holder that never releases it
    pub lease_time_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_time_ms: defaults::LOCK_WAIT_TIME_MS,
            lease_time_ms: defaults::LOCK_LEASE_TIME_MS,
        }
    }
}

impl LockConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn lease_time(&self) -> Duration {
        Duration::from_millis(self.lease_time_ms)
    }
}

/// Admission control for next calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NextCallConfig {
    /// Max concurrent next calls per query
    pub concurrency: u32,
    pub result_poll_interval_ms: u64,
    pub max_results_timeout_ms: u64,
}

impl Default for NextCallConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::NEXT_CALL_CONCURRENCY,
            result_poll_interval_ms: defaults::RESULT_POLL_INTERVAL_MS,
            max_results_timeout_ms: defaults::MAX_RESULTS_TIMEOUT_MS,
        }
    }
}

impl NextCallConfig {
    pub fn result_poll_interval(&self) -> Duration {
        Duration::from_millis(self.result_poll_interval_ms)
    }

    pub fn max_results_timeout(&self) -> Duration {
        Duration::from_millis(self.max_results_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Default per-query cap on running tasks
    pub max_running: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_running: defaults::MAX_RUNNING_TASKS,
        }
    }
}

/// Lockable storage substrate selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    InMemory,
    Redis,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub redis_url: Option<String>,
}

/// Result transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagingBackend {
    #[default]
    PartitionedLog,
    Broker,
    DistributedQueue,
}

impl std::fmt::Display for MessagingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PartitionedLog => write!(f, "partitioned_log"),
            Self::Broker => write!(f, "broker"),
            Self::DistributedQueue => write!(f, "distributed_queue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub backend: MessagingBackend,
    /// Listener workers per channel
    pub concurrency: u32,
    pub partitioned_log: PartitionedLogConfig,
    pub broker: BrokerConfig,
    pub claim_check: ClaimCheckConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            backend: MessagingBackend::default(),
            concurrency: defaults::LISTENER_CONCURRENCY,
            partitioned_log: PartitionedLogConfig::default(),
            broker: BrokerConfig::default(),
            claim_check: ClaimCheckConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionedLogConfig {
    pub partitions: u32,
    pub poll_timeout_ms: u64,
    pub max_message_bytes: usize,
}

impl Default for PartitionedLogConfig {
    fn default() -> Self {
        Self {
            partitions: defaults::LOG_PARTITIONS,
            poll_timeout_ms: defaults::LOG_POLL_TIMEOUT_MS,
            max_message_bytes: LOG_DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl PartitionedLogConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP url; without one the in-process broker is used
    pub url: Option<String>,
    /// Durable queues and persistent messages
    pub durable: bool,
    pub max_message_size_bytes: usize,
    pub prefetch: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            durable: true,
            max_message_size_bytes: BROKER_MAX_MESSAGE_SIZE_BYTES,
            prefetch: defaults::BROKER_PREFETCH,
        }
    }
}

impl BrokerConfig {
    /// Hard ceiling, never above the broker's own 512 MiB limit
    pub fn effective_max_message_size(&self) -> usize {
        self.max_message_size_bytes.min(BROKER_MAX_MESSAGE_SIZE_BYTES)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimCheckConfig {
    pub enabled: bool,
    /// Payloads above this size go through the claim check. Defaults to the
    /// selected backend's message ceiling.
    pub threshold_bytes: Option<usize>,
}

impl Default for ClaimCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: None,
        }
    }
}

impl MessagingConfig {
    /// Hard per-message ceiling of the selected backend, if it has one
    pub fn backend_max_message_bytes(&self) -> Option<usize> {
        match self.backend {
            MessagingBackend::PartitionedLog => Some(self.partitioned_log.max_message_bytes),
            MessagingBackend::Broker => Some(self.broker.effective_max_message_size()),
            MessagingBackend::DistributedQueue => None,
        }
    }

    /// Size above which payloads are diverted to the claim check
    pub fn claim_check_threshold(&self) -> Option<usize> {
        self.claim_check
            .threshold_bytes
            .or_else(|| self.backend_max_message_bytes())
    }
}

impl CoordinatorConfig {
    /// Validate the configuration, reporting the first offending field
    pub fn validate(&self) -> CoordinationResult<()> {
        if self.lock.wait_time_ms == 0 {
            return Err(invalid("lock.wait_time_ms", "wait time must be greater than 0"));
        }
        if self.lock.lease_time_ms == 0 {
            return Err(invalid("lock.lease_time_ms", "lease time must be greater than 0"));
        }
        if self.next_call.concurrency == 0 {
            return Err(invalid("next_call.concurrency", "concurrency must be greater than 0"));
        }
        if self.tasks.max_running == 0 {
            return Err(invalid("tasks.max_running", "max running must be greater than 0"));
        }
        if self.messaging.concurrency == 0 {
            return Err(invalid("messaging.concurrency", "concurrency must be greater than 0"));
        }
        if self.messaging.partitioned_log.partitions == 0 {
            return Err(invalid(
                "messaging.partitioned_log.partitions",
                "partition count must be greater than 0",
            ));
        }
        if self.messaging.broker.prefetch == 0 {
            return Err(invalid("messaging.broker.prefetch", "prefetch must be greater than 0"));
        }
        if let Some(url) = &self.messaging.broker.url {
            if !url.starts_with("amqp://") && !url.starts_with("amqps://") {
                return Err(invalid("messaging.broker.url", "url must use the amqp or amqps scheme"));
            }
        }
        if let Some(threshold) = self.messaging.claim_check.threshold_bytes {
            if threshold > BROKER_MAX_MESSAGE_SIZE_BYTES {
                return Err(invalid(
                    "messaging.claim_check.threshold_bytes",
                    format!("threshold {threshold} exceeds broker ceiling {BROKER_MAX_MESSAGE_SIZE_BYTES}"),
                ));
            }
        }
        if self.storage.backend == StorageBackend::Redis && self.storage.redis_url.is_none() {
            return Err(invalid("storage.redis_url", "redis backend requires a url"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> CoordinationError {
    CoordinationError::configuration(field, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock.wait_time(), Duration::from_secs(5));
        assert_eq!(config.lock.lease_time(), Duration::from_secs(30));
        assert_eq!(config.next_call.concurrency, 1);
        assert!(config.messaging.broker.durable);
        assert!(config.messaging.claim_check.enabled);
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = CoordinatorConfig::default();
        config.lock.lease_time_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(CoordinationError::Configuration { component, .. }) if component == "lock.lease_time_ms"
        ));

        let mut config = CoordinatorConfig::default();
        config.messaging.partitioned_log.partitions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_claim_check_threshold_above_ceiling_rejected() {
        let mut config = CoordinatorConfig::default();
        config.messaging.claim_check.threshold_bytes = Some(BROKER_MAX_MESSAGE_SIZE_BYTES + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_broker_url_scheme_validated() {
        let mut config = CoordinatorConfig::default();
        config.messaging.broker.url = Some("http://rabbit:15672".to_string());
        assert!(config.validate().is_err());

        config.messaging.broker.url = Some("amqps://rabbit:5671/%2F".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_broker_ceiling_is_capped() {
        let broker = BrokerConfig {
            max_message_size_bytes: usize::MAX,
            ..Default::default()
        };
        assert_eq!(broker.effective_max_message_size(), BROKER_MAX_MESSAGE_SIZE_BYTES);
    }

    #[test]
    fn test_claim_check_threshold_follows_backend() {
        let mut messaging = MessagingConfig::default();
        assert_eq!(messaging.claim_check_threshold(), Some(LOG_DEFAULT_MAX_MESSAGE_BYTES));

        messaging.backend = MessagingBackend::DistributedQueue;
        assert_eq!(messaging.claim_check_threshold(), None);

        messaging.claim_check.threshold_bytes = Some(64);
        assert_eq!(messaging.claim_check_threshold(), Some(64));
    }

    #[test]
    fn test_partial_source_uses_defaults() {
        let config: CoordinatorConfig = serde_json::from_value(serde_json::json!({
            "lock": { "wait_time_ms": 100 },
            "messaging": { "backend": "broker" }
        }))
        .unwrap();
        assert_eq!(config.lock.wait_time_ms, 100);
        assert_eq!(config.lock.lease_time_ms, defaults::LOCK_LEASE_TIME_MS);
        assert_eq!(config.messaging.backend, MessagingBackend::Broker);
    }
}
