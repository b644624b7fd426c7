//! Reserved-only rate limiter for the no-sharing case.

use super::RateLimiter;
use crate::error::RateLimiterError;
use crate::events::{Event, EventBus, ListenerId};
use crate::lifecycle::{Phase, PhaseCell};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Rate limiter whose capacity is a fixed reservation.
///
/// `max_capacity == capacity == reserved` and capacity requests are
/// ignored. It exists so the batcher's rate-limiter slot has a meaningful
/// occupant when no capacity is shared.
pub struct ProvisionedResource {
    reserved: u32,
    events: EventBus,
    phase: PhaseCell,
}

impl ProvisionedResource {
    /// Creates a limiter that always supplies `reserved` capacity per second.
    pub fn new(reserved: u32) -> Self {
        Self {
            reserved,
            events: EventBus::new(),
            phase: PhaseCell::new(),
        }
    }

    /// Registers an observability listener.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.add_listener(listener)
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.events.remove_listener(id);
    }
}

#[async_trait]
impl RateLimiter for ProvisionedResource {
    fn max_capacity(&self) -> u32 {
        self.reserved
    }

    fn capacity(&self) -> u32 {
        self.reserved
    }

    fn give_me(&self, _target: u32) {}

    async fn provision(&self) -> Result<(), RateLimiterError> {
        if !self.phase.advance(Phase::Uninitialized, Phase::Provisioned) {
            return Err(RateLimiterError::ImproperOrder);
        }
        Ok(())
    }

    async fn start(&self, _shutdown: CancellationToken) -> Result<(), RateLimiterError> {
        if !self.phase.advance(Phase::Provisioned, Phase::Started) {
            return Err(RateLimiterError::ImproperOrder);
        }
        self.events.emit(&Event::Capacity {
            capacity: self.reserved,
        });
        Ok(())
    }

    fn stop(&self) {
        self.phase.set(Phase::Stopped);
    }
}
