//! Lease manager over a blob store with conditional create and leases.

use super::LeaseManager;
use crate::config::LEASE_TTL;
use crate::error::LeaseError;
use crate::events::{Event, EventBus};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of a conditional create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Created,
    AlreadyExists,
}

/// Result of a lease request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    /// Another holder has the lease.
    Conflict,
}

/// Minimal blob-store surface the lease manager needs.
///
/// Implementations must guarantee that at most one holder can acquire a
/// lease on any one blob at a time; that property is what makes partition
/// ownership exclusive across processes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Name of the backing container, for observability.
    fn container(&self) -> &str;

    /// Creates the container when missing.
    async fn create_container(&self) -> Result<StoreOutcome, LeaseError>;

    /// Creates a zero-byte blob when missing.
    async fn create_blob(&self, name: &str) -> Result<StoreOutcome, LeaseError>;

    /// Requests an exclusive lease on `name` for `ttl`.
    async fn acquire_lease(
        &self,
        name: &str,
        lease_id: Uuid,
        ttl: Duration,
    ) -> Result<LeaseOutcome, LeaseError>;
}

/// Lease manager that maps partitions onto zero-byte blobs named by index.
pub struct BlobLeaseManager {
    store: Arc<dyn BlobStore>,
    ttl: Duration,
    events: RwLock<Option<EventBus>>,
}

impl BlobLeaseManager {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            ttl: LEASE_TTL,
            events: RwLock::new(None),
        }
    }

    fn emit(&self, event: &Event) {
        if let Some(events) = self.events.read().expect("event wiring poisoned").as_ref() {
            events.emit(event);
        }
    }
}

#[async_trait]
impl LeaseManager for BlobLeaseManager {
    fn raise_events_to(&self, events: EventBus) {
        *self.events.write().expect("event wiring poisoned") = Some(events);
    }

    async fn provision(&self) -> Result<(), LeaseError> {
        let container = self.store.container().to_string();
        match self.store.create_container().await? {
            StoreOutcome::Created => {
                info!(container = %container, "created lease container");
                self.emit(&Event::CreatedContainer { container });
            }
            StoreOutcome::AlreadyExists => {
                debug!(container = %container, "verified lease container");
                self.emit(&Event::VerifiedContainer { container });
            }
        }
        Ok(())
    }

    async fn create_partitions(&self, count: u32) -> Result<(), LeaseError> {
        for partition in 0..count {
            match self.store.create_blob(&partition.to_string()).await? {
                StoreOutcome::Created => self.emit(&Event::CreatedBlob { partition }),
                StoreOutcome::AlreadyExists => self.emit(&Event::VerifiedBlob { partition }),
            }
        }
        debug!(count, "partition blobs ready");
        Ok(())
    }

    async fn lease_partition(&self, lease_id: Uuid, index: u32) -> Result<Duration, LeaseError> {
        match self
            .store
            .acquire_lease(&index.to_string(), lease_id, self.ttl)
            .await?
        {
            LeaseOutcome::Acquired => Ok(self.ttl),
            LeaseOutcome::Conflict => Ok(Duration::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// In-memory store recording calls; `existing` marks names (and the
    /// container) as pre-existing, `held` marks blobs whose lease is taken.
    #[derive(Default)]
    struct FakeStore {
        container_exists: bool,
        existing_blobs: Vec<String>,
        held_leases: Vec<String>,
        lease_calls: AtomicU32,
        created: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BlobStore for FakeStore {
        fn container(&self) -> &str {
            "throughput"
        }

        async fn create_container(&self) -> Result<StoreOutcome, LeaseError> {
            if self.container_exists {
                Ok(StoreOutcome::AlreadyExists)
            } else {
                Ok(StoreOutcome::Created)
            }
        }

        async fn create_blob(&self, name: &str) -> Result<StoreOutcome, LeaseError> {
            if self.existing_blobs.iter().any(|b| b == name) {
                Ok(StoreOutcome::AlreadyExists)
            } else {
                self.created.lock().unwrap().push(name.to_string());
                Ok(StoreOutcome::Created)
            }
        }

        async fn acquire_lease(
            &self,
            name: &str,
            _lease_id: Uuid,
            _ttl: Duration,
        ) -> Result<LeaseOutcome, LeaseError> {
            self.lease_calls.fetch_add(1, Ordering::SeqCst);
            if self.held_leases.iter().any(|b| b == name) {
                Ok(LeaseOutcome::Conflict)
            } else {
                Ok(LeaseOutcome::Acquired)
            }
        }
    }

    fn collect_events(manager: &BlobLeaseManager) -> (EventBus, Arc<Mutex<Vec<String>>>) {
        let bus = EventBus::new();
        let names = Arc::new(Mutex::new(Vec::new()));
        let seen = names.clone();
        bus.add_listener(move |event: &Event| {
            seen.lock().unwrap().push(event.name().to_string());
        });
        manager.raise_events_to(bus.clone());
        (bus, names)
    }

    #[tokio::test]
    async fn provision_reports_container_creation() {
        let manager = BlobLeaseManager::new(Arc::new(FakeStore::default()));
        let (_bus, names) = collect_events(&manager);
        manager.provision().await.unwrap();
        assert_eq!(*names.lock().unwrap(), vec!["created-container"]);
    }

    #[tokio::test]
    async fn provision_reports_an_existing_container() {
        let store = FakeStore {
            container_exists: true,
            ..FakeStore::default()
        };
        let manager = BlobLeaseManager::new(Arc::new(store));
        let (_bus, names) = collect_events(&manager);
        manager.provision().await.unwrap();
        assert_eq!(*names.lock().unwrap(), vec!["verified-container"]);
    }

    #[tokio::test]
    async fn create_partitions_is_idempotent_per_blob() {
        let store = Arc::new(FakeStore {
            existing_blobs: vec!["0".to_string(), "2".to_string()],
            ..FakeStore::default()
        });
        let manager = BlobLeaseManager::new(store.clone());
        let (_bus, names) = collect_events(&manager);
        manager.create_partitions(3).await.unwrap();
        assert_eq!(
            *names.lock().unwrap(),
            vec!["verified-blob", "created-blob", "verified-blob"]
        );
        assert_eq!(*store.created.lock().unwrap(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn lease_partition_returns_the_ttl_or_zero() {
        let store = Arc::new(FakeStore {
            held_leases: vec!["1".to_string()],
            ..FakeStore::default()
        });
        let manager = BlobLeaseManager::new(store.clone());

        let granted = manager.lease_partition(Uuid::new_v4(), 0).await.unwrap();
        assert_eq!(granted, LEASE_TTL);

        let contended = manager.lease_partition(Uuid::new_v4(), 1).await.unwrap();
        assert_eq!(contended, Duration::ZERO);
        assert_eq!(store.lease_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn events_are_optional() {
        let manager = BlobLeaseManager::new(Arc::new(FakeStore::default()));
        // No bus wired; must not panic.
        manager.provision().await.unwrap();
        manager.create_partitions(1).await.unwrap();
    }
}
