//! Paceline - client-side cooperative rate-limited batching.
//!
//! This library paces high-volume work (database writes, API calls)
//! against a fixed per-second capacity that may be shared across many
//! processes or containers. Callers enqueue cost-bearing [`Operation`]s;
//! the engine groups them into batches and hands each batch to a
//! [`Watcher`] callback only when enough capacity is available within the
//! current timeslice.
//!
//! # High-Level Flow
//!
//! ```ignore
//! use std::sync::Arc;
//! use paceline::{Batcher, Operation, ProvisionedResource, Watcher};
//! use tokio_util::sync::CancellationToken;
//!
//! let limiter = Arc::new(ProvisionedResource::new(2_000));
//! let batcher = Batcher::new()
//!     .with_rate_limiter(limiter);
//!
//! let watcher = Arc::new(Watcher::new(|batch| async move {
//!     // write `batch` to the datastore
//! }));
//!
//! let shutdown = CancellationToken::new();
//! batcher.start(shutdown.clone())?;
//! batcher.enqueue(Operation::new(watcher, 10, row, true)).await?;
//! ```
//!
//! # Shared Capacity
//!
//! When several processes must divide one provisioned throughput (for
//! example a database rated for 20k units/s), each runs a
//! [`SharedResource`] pointed at the same blob container. The pool is
//! split into partitions worth `factor` capacity each; a process may
//! dispatch work only against the partitions it currently holds exclusive
//! leases on, so the fleet's combined pace never exceeds the pool. See the
//! [`limiter`] and [`lease`] modules.

pub mod batcher;
pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod lease;
pub mod limiter;
pub mod operation;
pub mod watcher;

mod lifecycle;

pub use batcher::Batcher;
pub use buffer::Buffer;
pub use error::{BatcherError, LeaseError, RateLimiterError};
pub use events::{tracing_listener, AuditFailure, Event, EventBus, ListenerId};
pub use lease::{AzureBlobStore, BlobLeaseManager, BlobStore, LeaseManager, LeaseOutcome, StoreOutcome};
pub use limiter::{ProvisionedResource, RateLimiter, SharedResource};
pub use operation::Operation;
pub use watcher::{Batch, Watcher};

/// Version of the paceline library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
