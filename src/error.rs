//! # Coordination Error Types
//!
//! Structured error taxonomy shared by the task-state machine, the locked
//! update protocol, admission control and result delivery. Retryable
//! conditions (contention, admission refusal, transport timeouts) are kept
//! distinguishable from fatal ones so an outer layer can map them to
//! retry-after semantics.

use thiserror::Error;

/// Comprehensive coordination error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinationError {
    #[error("Lock timeout: unable to acquire lock on {key} within {wait_ms}ms")]
    LockTimeout { key: String, wait_ms: u64 },

    #[error("Not found: {entity} {key}")]
    NotFound { entity: String, key: String },

    #[error("Concurrent next call limit reached for query {query_id}: {limit}")]
    ConcurrencyLimitExceeded { query_id: String, limit: u32 },

    #[error("Invalid state for {operation} on query {query_id}: {state}")]
    InvalidState {
        query_id: String,
        state: String,
        operation: String,
    },

    #[error("Serialization failure: {context}: {message}")]
    SerializationFailure { context: String, message: String },

    #[error("Transport failure: {backend}: {operation}: {message}")]
    TransportFailure {
        backend: String,
        operation: String,
        message: String,
    },

    #[error("Payload of {size_bytes} bytes exceeds limit of {limit_bytes} bytes and no claim check is configured")]
    OversizedPayloadWithoutClaimCheck {
        size_bytes: usize,
        limit_bytes: usize,
    },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Storage error: {backend}: {message}")]
    Storage { backend: String, message: String },

    #[error("Internal coordination error: {message}")]
    Internal { message: String },
}

impl CoordinationError {
    /// Create a lock timeout error
    pub fn lock_timeout(key: impl Into<String>, wait_ms: u64) -> Self {
        Self::LockTimeout {
            key: key.into(),
            wait_ms,
        }
    }

    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    /// Create an admission refusal error
    pub fn concurrency_limit(query_id: impl Into<String>, limit: u32) -> Self {
        Self::ConcurrencyLimitExceeded {
            query_id: query_id.into(),
            limit,
        }
    }

    /// Create an invalid lifecycle state error
    pub fn invalid_state(
        query_id: impl Into<String>,
        state: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            query_id: query_id.into(),
            state: state.into(),
            operation: operation.into(),
        }
    }

    /// Create a serialization failure
    pub fn serialization(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SerializationFailure {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a transport failure
    pub fn transport(
        backend: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TransportFailure {
            backend: backend.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an oversized payload error
    pub fn oversized_payload(size_bytes: usize, limit_bytes: usize) -> Self {
        Self::OversizedPayloadWithoutClaimCheck {
            size_bytes,
            limit_bytes,
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a storage backend error
    pub fn storage(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the operation after backing off
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::ConcurrencyLimitExceeded { .. }
                | Self::TransportFailure { .. }
        )
    }

    /// Whether the error indicates corrupt data or misconfiguration that must
    /// be surfaced to operators
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SerializationFailure { .. }
                | Self::OversizedPayloadWithoutClaimCheck { .. }
                | Self::Configuration { .. }
        )
    }

    /// Whether the entry the caller operated on no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Conversion from serde_json::Error to CoordinationError
impl From<serde_json::Error> for CoordinationError {
    fn from(err: serde_json::Error) -> Self {
        CoordinationError::serialization("json", err.to_string())
    }
}

/// Conversion from config::ConfigError to CoordinationError
impl From<config::ConfigError> for CoordinationError {
    fn from(err: config::ConfigError) -> Self {
        CoordinationError::configuration("config", err.to_string())
    }
}

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CoordinationError::lock_timeout("queryStatus:abc", 100).is_retryable());
        assert!(CoordinationError::concurrency_limit("abc", 1).is_retryable());
        assert!(CoordinationError::transport("broker", "publish", "timeout").is_retryable());

        assert!(!CoordinationError::not_found("query status", "abc").is_retryable());
        assert!(CoordinationError::not_found("query status", "abc").is_not_found());

        assert!(CoordinationError::serialization("task states", "bad").is_fatal());
        assert!(CoordinationError::oversized_payload(10, 5).is_fatal());
        assert!(!CoordinationError::lock_timeout("k", 1).is_fatal());
    }

    #[test]
    fn test_error_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid json").unwrap_err();
        let err: CoordinationError = json_err.into();
        assert!(matches!(err, CoordinationError::SerializationFailure { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = CoordinationError::concurrency_limit("q-1", 3);
        let display = format!("{err}");
        assert!(display.contains("Concurrent next call limit reached"));
        assert!(display.contains("q-1"));

        let err = CoordinationError::oversized_payload(2048, 1024);
        let display = format!("{err}");
        assert!(display.contains("2048"));
        assert!(display.contains("no claim check"));
    }
}
