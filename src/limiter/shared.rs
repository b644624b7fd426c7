//! Shared rate limiter: reserved capacity plus leased partitions.
//!
//! The shared pool is divided into partitions worth `factor` capacity each.
//! A control loop wakes on a jittered interval, and whenever it owns fewer
//! partitions than the current target it tries to lease one more random
//! unowned slot through the lease manager. Exclusive ownership across
//! processes is enforced by the external store, not by local locking; the
//! jitter keeps competing processes from colliding on the same slots at the
//! same instants.
//!
//! Leases are never renewed. Each acquired slot is cleared again when its
//! lease duration elapses, which continuously redistributes capacity among
//! the processes still asking for it.

use super::RateLimiter;
use crate::config::{DEFAULT_FACTOR, DEFAULT_MAX_LEASE_INTERVAL, MAX_PARTITIONS};
use crate::error::RateLimiterError;
use crate::events::{Event, EventBus, ListenerId};
use crate::lease::LeaseManager;
use crate::lifecycle::{Phase, PhaseCell};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Rate limiter that grows its capacity toward the requested target by
/// leasing partitions from a pool shared across processes.
pub struct SharedResource {
    state: Arc<ResourceState>,
}

struct ResourceState {
    events: EventBus,
    phase: PhaseCell,
    config: RwLock<ResourceConfig>,
    /// Allocated capacity (owned partitions × factor), excluding the
    /// reservation.
    capacity: AtomicU32,
    /// Number of partitions the loop is currently pursuing.
    target: AtomicU32,
    /// Slot table: the lease id held locally, or `None` when unowned.
    partitions: RwLock<Vec<Option<Uuid>>>,
    stop: Mutex<Option<CancellationToken>>,
}

struct ResourceConfig {
    shared_capacity: u32,
    reserved_capacity: u32,
    factor: u32,
    max_interval: Duration,
    lease_manager: Option<Arc<dyn LeaseManager>>,
}

impl SharedResource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ResourceState {
                events: EventBus::new(),
                phase: PhaseCell::new(),
                config: RwLock::new(ResourceConfig {
                    shared_capacity: 0,
                    reserved_capacity: 0,
                    factor: DEFAULT_FACTOR,
                    max_interval: DEFAULT_MAX_LEASE_INTERVAL,
                    lease_manager: None,
                }),
                capacity: AtomicU32::new(0),
                target: AtomicU32::new(0),
                partitions: RwLock::new(Vec::new()),
                stop: Mutex::new(None),
            }),
        }
    }

    /// Sets the capacity shared across processes and the lease manager that
    /// coordinates it. The manager's events are raised on this resource.
    pub fn with_shared_capacity(self, capacity: u32, manager: Arc<dyn LeaseManager>) -> Self {
        let events = self.state.events.clone();
        self.configure(move |cfg| {
            manager.raise_events_to(events);
            cfg.shared_capacity = capacity;
            cfg.lease_manager = Some(manager);
        });
        self
    }

    /// Sets capacity that is always available to this process, on top of
    /// whatever is leased from the shared pool.
    pub fn with_reserved_capacity(self, capacity: u32) -> Self {
        self.configure(|cfg| cfg.reserved_capacity = capacity);
        self
    }

    /// Sets how much capacity each partition is worth. Defaults to 1; pools
    /// larger than 500 need a proportionally larger factor.
    pub fn with_factor(self, factor: u32) -> Self {
        self.configure(|cfg| cfg.factor = factor);
        self
    }

    /// Sets the upper bound of the jittered interval between lease
    /// attempts. Defaults to 500 ms.
    pub fn with_max_interval(self, interval: Duration) -> Self {
        self.configure(|cfg| cfg.max_interval = interval);
        self
    }

    /// Registers an observability listener.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.state.events.add_listener(listener)
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.state.events.remove_listener(id);
    }

    fn configure(&self, apply: impl FnOnce(&mut ResourceConfig)) {
        if self.state.phase.current() != Phase::Uninitialized {
            panic!("{}", RateLimiterError::InitializationOnly);
        }
        apply(&mut self.state.config.write().expect("config lock poisoned"));
    }
}

impl Default for SharedResource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiter for SharedResource {
    fn max_capacity(&self) -> u32 {
        let cfg = self.state.config.read().expect("config lock poisoned");
        cfg.shared_capacity.saturating_add(cfg.reserved_capacity)
    }

    fn capacity(&self) -> u32 {
        let reserved = self
            .state
            .config
            .read()
            .expect("config lock poisoned")
            .reserved_capacity;
        self.state
            .capacity
            .load(Ordering::Relaxed)
            .saturating_add(reserved)
    }

    fn give_me(&self, target: u32) {
        let (reserved, factor) = {
            let cfg = self.state.config.read().expect("config lock poisoned");
            (cfg.reserved_capacity, cfg.factor.max(1))
        };
        let remaining = target.saturating_sub(reserved);
        let partitions = remaining.div_ceil(factor);
        self.state.events.emit(&Event::Target {
            capacity: remaining,
        });
        self.state.target.store(partitions, Ordering::Relaxed);
        trace!(requested = target, partitions, "capacity target updated");
    }

    async fn provision(&self) -> Result<(), RateLimiterError> {
        let state = &self.state;
        let (manager, count) = {
            let mut cfg = state.config.write().expect("config lock poisoned");
            let manager = cfg
                .lease_manager
                .clone()
                .ok_or(RateLimiterError::UndefinedLeaseManager)?;
            if cfg.factor == 0 {
                cfg.factor = DEFAULT_FACTOR;
            }
            if cfg.shared_capacity < 1 {
                return Err(RateLimiterError::UndefinedSharedCapacity);
            }
            if cfg.max_interval.is_zero() {
                cfg.max_interval = DEFAULT_MAX_LEASE_INTERVAL;
            }
            let count = cfg.shared_capacity.div_ceil(cfg.factor);
            if count > MAX_PARTITIONS {
                return Err(RateLimiterError::PartitionsOutOfRange {
                    capacity: cfg.shared_capacity.saturating_add(cfg.reserved_capacity),
                    factor: cfg.factor,
                    partitions: count,
                    max: MAX_PARTITIONS,
                });
            }
            (manager, count)
        };
        if !state.phase.advance(Phase::Uninitialized, Phase::Provisioned) {
            return Err(RateLimiterError::ImproperOrder);
        }
        state.events.emit(&Event::ProvisionStart);
        if let Err(err) = manager.provision().await {
            // The store was never prepared; allow another provision attempt.
            state.phase.set(Phase::Uninitialized);
            return Err(err.into());
        }
        *state.partitions.write().expect("partition table poisoned") = vec![None; count as usize];
        manager.create_partitions(count).await?;
        state.events.emit(&Event::ProvisionDone);
        debug!(partitions = count, "shared capacity provisioned");
        Ok(())
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<(), RateLimiterError> {
        let state = &self.state;
        if !state.phase.advance(Phase::Provisioned, Phase::Started) {
            return Err(RateLimiterError::ImproperOrder);
        }
        let stop = shutdown.child_token();
        *state.stop.lock().expect("stop token poisoned") = Some(stop.clone());
        state.recalculate();
        let state = state.clone();
        tokio::spawn(async move { state.run(stop).await });
        Ok(())
    }

    fn stop(&self) {
        if self.state.phase.current() == Phase::Stopped {
            return;
        }
        if let Some(stop) = self.state.stop.lock().expect("stop token poisoned").take() {
            stop.cancel();
        }
        self.state.phase.set(Phase::Stopped);
    }
}

impl ResourceState {
    /// Recounts owned partitions, stores the allocated capacity, and
    /// announces the usable total.
    fn recalculate(&self) {
        let (factor, reserved) = {
            let cfg = self.config.read().expect("config lock poisoned");
            (cfg.factor.max(1), cfg.reserved_capacity)
        };
        let owned = self
            .partitions
            .read()
            .expect("partition table poisoned")
            .iter()
            .filter(|slot| slot.is_some())
            .count() as u32;
        let allocated = owned.saturating_mul(factor);
        self.capacity.store(allocated, Ordering::Relaxed);
        self.events.emit(&Event::Capacity {
            capacity: allocated.saturating_add(reserved),
        });
    }

    /// Counts owned slots and picks a random unowned one, if any.
    fn pick_unowned(&self) -> Option<(u32, u32)> {
        let partitions = self.partitions.read().expect("partition table poisoned");
        let owned = partitions.iter().filter(|slot| slot.is_some()).count() as u32;
        let unowned: Vec<u32> = partitions
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
            .collect();
        if unowned.is_empty() {
            return None;
        }
        let pick = unowned[rand::thread_rng().gen_range(0..unowned.len())];
        Some((owned, pick))
    }

    fn set_partition(&self, index: u32, lease_id: Uuid) {
        let mut partitions = self.partitions.write().expect("partition table poisoned");
        partitions[index as usize] = Some(lease_id);
    }

    fn clear_partition(&self, index: u32) {
        let mut partitions = self.partitions.write().expect("partition table poisoned");
        partitions[index as usize] = None;
    }

    async fn run(self: Arc<Self>, stop: CancellationToken) {
        let (max_interval, manager) = {
            let cfg = self.config.read().expect("config lock poisoned");
            (cfg.max_interval, cfg.lease_manager.clone())
        };
        let manager = manager.expect("started without a lease manager");
        debug!("partition lease loop started");
        loop {
            let jitter = Duration::from_millis(
                rand::thread_rng().gen_range(0..max_interval.as_millis().max(1) as u64),
            );
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(jitter) => {}
            }

            let target = self.target.load(Ordering::Relaxed);
            let Some((owned, index)) = self.pick_unowned() else {
                continue;
            };
            if owned >= target {
                continue;
            }

            let lease_id = Uuid::new_v4();
            match manager.lease_partition(lease_id, index).await {
                Ok(duration) if duration > Duration::ZERO => {
                    self.set_partition(index, lease_id);
                    self.events.emit(&Event::Allocated { partition: index });
                    self.recalculate();
                    debug!(partition = index, ?duration, "partition lease acquired");

                    // Return the slot once the lease runs out. Detached so a
                    // stop cannot strand an owned slot as permanently held.
                    let state = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        state.clear_partition(index);
                        state.events.emit(&Event::Released { partition: index });
                        state.recalculate();
                    });
                }
                Ok(_) => {
                    trace!(partition = index, "partition lease contended");
                    self.events.emit(&Event::Failed { partition: index });
                }
                Err(err) => {
                    warn!(partition = index, error = %err, "partition lease attempt failed");
                    self.events.emit(&Event::Error {
                        message: err.to_string(),
                    });
                }
            }
        }
        self.events.emit(&Event::Shutdown);
        debug!("partition lease loop stopped");
    }
}
