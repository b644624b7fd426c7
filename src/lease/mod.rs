//! Cross-process partition lease coordination.
//!
//! The shared rate limiter never talks to a store directly; it goes through
//! the [`LeaseManager`] seam. The concrete [`BlobLeaseManager`] maps
//! partitions onto zero-byte blobs named by index and relies on the store's
//! conditional-create and lease primitives for mutual exclusion, so any
//! store offering create-if-missing and acquire-lease can back it.

mod azure;
mod blob;

pub use azure::AzureBlobStore;
pub use blob::{BlobLeaseManager, BlobStore, LeaseOutcome, StoreOutcome};

use crate::error::LeaseError;
use crate::events::EventBus;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Coordinates mutually-exclusive partition leases through an external
/// store.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Points the manager's observability events at `events`.
    fn raise_events_to(&self, events: EventBus);

    /// Idempotently ensures the shared store exists.
    async fn provision(&self) -> Result<(), LeaseError>;

    /// Idempotently creates `count` partition records named `0..count-1`.
    async fn create_partitions(&self, count: u32) -> Result<(), LeaseError>;

    /// Attempts an exclusive lease on partition `index`.
    ///
    /// Returns the duration the lease is held for; a zero duration means
    /// another process holds it. Store failures are errors, contention is
    /// not.
    async fn lease_partition(&self, lease_id: Uuid, index: u32) -> Result<Duration, LeaseError>;
}
