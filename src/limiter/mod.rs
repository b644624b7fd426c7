//! Rate limiters supply per-timeslice dispatch capacity.
//!
//! The batcher only consumes the [`RateLimiter`] trait: it asks for the
//! current per-second capacity when packing a flush pass, reports the
//! capacity it wants through [`give_me`](RateLimiter::give_me), and rejects
//! operations costlier than [`max_capacity`](RateLimiter::max_capacity)
//! outright. Two implementations ship with the engine:
//!
//! - [`ProvisionedResource`] — a fixed reservation, for the no-sharing case.
//! - [`SharedResource`] — a reservation plus capacity leased one partition
//!   at a time from a pool shared across processes.

mod provisioned;
mod shared;

pub use provisioned::ProvisionedResource;
pub use shared::SharedResource;

use crate::error::RateLimiterError;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Per-second capacity supplier consulted by the batcher.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Upper bound on any single operation's cost. Enqueue rejects
    /// operations that could never be afforded.
    fn max_capacity(&self) -> u32;

    /// Capacity currently usable per second.
    fn capacity(&self) -> u32;

    /// Records the capacity the caller currently wants. How (and whether)
    /// the limiter pursues it is implementation-defined.
    fn give_me(&self, target: u32);

    /// Idempotently prepares any external state. Must be called before
    /// [`start`](RateLimiter::start).
    async fn provision(&self) -> Result<(), RateLimiterError>;

    /// Starts background coordination; cancelling `shutdown` ends it.
    async fn start(&self, shutdown: CancellationToken) -> Result<(), RateLimiterError>;

    /// Ends background coordination. Idempotent; the component cannot be
    /// restarted afterwards.
    fn stop(&self);
}
