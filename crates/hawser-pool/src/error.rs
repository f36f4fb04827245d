//! Pool error taxonomy.

use std::time::Duration;

use thiserror::Error;

use hawser_core::ChannelError;

use crate::connection::ConnectionState;

/// Result type for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors that can occur in pool operations.
///
/// Only caller-facing operations (acquire, explicit create, explicit
/// validate) surface errors; failures detected by background sweeps are
/// internal and visible only through statistics and events.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The channel factory or connect failed while creating a connection
    #[error("Connection creation failed for {endpoint}: {source}")]
    CreationFailed {
        /// Canonical endpoint key
        endpoint: String,
        /// Underlying channel failure
        #[source]
        source: ChannelError,
    },

    /// No connection became available before the deadline
    #[error("Acquire timed out for {endpoint} after {waited:?}")]
    AcquireTimeout {
        /// Canonical endpoint key
        endpoint: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// The connection is not in a leasable state, or a lease is already
    /// outstanding past the deadline
    #[error("Lease unavailable: connection is {state}")]
    LeaseUnavailable {
        /// State the connection was observed in
        state: ConnectionState,
    },

    /// Operation on a pool after shutdown has begun
    #[error("Pool is closed")]
    Closed,

    /// Construction-time configuration validation failure
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Whether this error is an acquisition timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::AcquireTimeout { .. })
    }

    /// Whether this error is a connection creation failure
    #[must_use]
    pub const fn is_creation_failure(&self) -> bool {
        matches!(self, Self::CreationFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = PoolError::AcquireTimeout {
            endpoint: "tcp://db:5432".to_string(),
            waited: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("tcp://db:5432"));
        assert!(err.is_timeout());
        assert!(!err.is_creation_failure());
    }

    #[test]
    fn test_creation_failure_source() {
        let err = PoolError::CreationFailed {
            endpoint: "tcp://db:5432".to_string(),
            source: ChannelError::ConnectFailed("refused".to_string()),
        };
        assert!(err.is_creation_failure());
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_timeout_vs_creation_are_distinct() {
        let timeout = PoolError::AcquireTimeout {
            endpoint: "tcp://a:1".to_string(),
            waited: Duration::ZERO,
        };
        let creation = PoolError::CreationFailed {
            endpoint: "tcp://a:1".to_string(),
            source: ChannelError::Timeout,
        };
        assert!(timeout.is_timeout() && !creation.is_timeout());
        assert!(creation.is_creation_failure() && !timeout.is_creation_failure());
    }
}
