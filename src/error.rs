//! Error types for the batching engine.
//!
//! Errors are grouped by subsystem: admission/scheduling failures on the
//! batcher, lifecycle and provisioning failures on the rate limiters, and
//! store-level failures on the lease backend.

use thiserror::Error;

/// Errors returned by [`Batcher`](crate::Batcher) operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BatcherError {
    /// The operation's cost exceeds the rate limiter's maximum capacity, so
    /// no flush pass could ever afford it.
    #[error("operation cost exceeds the rate limiter's maximum capacity")]
    TooExpensive,

    /// The operation has already been admitted `max_attempts` times.
    #[error("operation has exhausted its maximum enqueue attempts")]
    TooManyAttempts,

    /// The buffer is full and the batcher is in error-on-full mode.
    #[error("the buffer is full")]
    BufferFull,

    /// The operation is still in the buffer from a previous enqueue.
    #[error("operation is already enqueued")]
    AlreadyEnqueued,

    /// A lifecycle method was called out of order (for example a second
    /// start, or a start after stop).
    #[error("lifecycle methods were called out of order")]
    ImproperOrder,

    /// A configuration setter was called after start.
    #[error("configuration is only allowed before start")]
    InitializationOnly,
}

/// Errors returned by rate limiter lifecycle operations.
#[derive(Debug, Error)]
pub enum RateLimiterError {
    /// A lifecycle method was called out of order (start before provision,
    /// double provision, and so on).
    #[error("lifecycle methods were called out of order")]
    ImproperOrder,

    /// A configuration setter was called after provisioning began.
    #[error("configuration is only allowed before provisioning")]
    InitializationOnly,

    /// The resource was provisioned without a lease manager.
    #[error("a lease manager is required to share capacity")]
    UndefinedLeaseManager,

    /// The resource was provisioned with a shared capacity below 1.
    #[error("shared capacity must be at least 1")]
    UndefinedSharedCapacity,

    /// The shared capacity divided by the factor needs more partitions than
    /// the store can reasonably hold.
    #[error(
        "sharing {capacity} capacity at a factor of {factor} needs {partitions} partitions; \
         the maximum is {max} (raise the factor)"
    )]
    PartitionsOutOfRange {
        capacity: u32,
        factor: u32,
        partitions: u32,
        max: u32,
    },

    /// The lease backend failed while provisioning.
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

/// Errors surfaced by lease managers and their backing stores.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The store answered with an unexpected status.
    #[error("blob store returned HTTP {status} during {operation}")]
    Store {
        operation: &'static str,
        status: u16,
    },

    /// Transport-level failure talking to the store.
    #[error("blob store request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for LeaseError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_out_of_range_names_the_remedy() {
        let err = RateLimiterError::PartitionsOutOfRange {
            capacity: 10_000,
            factor: 1,
            partitions: 10_000,
            max: 500,
        };
        let msg = err.to_string();
        assert!(msg.contains("10000 partitions"));
        assert!(msg.contains("maximum is 500"));
    }

    #[test]
    fn lease_error_is_transparent_through_rate_limiter_error() {
        let err = RateLimiterError::from(LeaseError::Store {
            operation: "create container",
            status: 503,
        });
        assert_eq!(
            err.to_string(),
            "blob store returned HTTP 503 during create container"
        );
    }
}
