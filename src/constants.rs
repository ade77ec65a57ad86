//! # Constants
//!
//! Default values and storage/channel naming shared across the crate.

/// Cache name prefix for query status records
pub const QUERY_STATUS_CACHE: &str = "queryStatus";

/// Cache name prefix for task state records
pub const TASK_STATES_CACHE: &str = "taskStates";

/// Cache name prefix for query task records
pub const QUERY_TASK_CACHE: &str = "queryTask";

/// Prefix for per-query result channels (topics, queues)
pub const RESULTS_CHANNEL_PREFIX: &str = "queryResults.";

/// Prefix for per-query claim-check stores
pub const CLAIM_CHECK_PREFIX: &str = "claimCheck.";

/// Task ids handed out for a query start here
pub const FIRST_TASK_ID: u32 = 1;

/// Broker-internal message size ceiling (512 MiB)
pub const BROKER_MAX_MESSAGE_SIZE_BYTES: usize = 536_870_912;

/// Default per-record ceiling for the partitioned log (1 MiB)
pub const LOG_DEFAULT_MAX_MESSAGE_BYTES: usize = 1_048_576;

pub mod defaults {
    pub const LOCK_WAIT_TIME_MS: u64 = 5_000;
    pub const LOCK_LEASE_TIME_MS: u64 = 30_000;
    pub const NEXT_CALL_CONCURRENCY: u32 = 1;
    pub const RESULT_POLL_INTERVAL_MS: u64 = 6_000;
    pub const MAX_RESULTS_TIMEOUT_MS: u64 = 5_000;
    pub const MAX_RUNNING_TASKS: u32 = 1;
    pub const LISTENER_CONCURRENCY: u32 = 1;
    pub const LOG_PARTITIONS: u32 = 1;
    pub const LOG_POLL_TIMEOUT_MS: u64 = 500;
    pub const BROKER_PREFETCH: u16 = 1;
}
