//! Event fan-out for engine observability.
//!
//! The batcher, rate limiters, and lease managers emit typed [`Event`]s;
//! callers register listeners and decide how to present or aggregate them.
//! The bus does no filtering and applies no backpressure: `emit` fans out
//! synchronously under a read lock, so listeners must not block.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Reason attached to an `audit-fail` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditFailure {
    /// The needs-capacity counter should have been zero but was not.
    Target,
    /// The inflight counter should have been zero but was not.
    Inflight,
    /// Both counters should have been zero but were not.
    TargetAndInflight,
}

impl AuditFailure {
    /// Human-readable description of what the audit corrected.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Target => "needs-capacity should have been zero but was not; it was reset",
            Self::Inflight => "inflight should have been zero but was not; it was reset",
            Self::TargetAndInflight => {
                "needs-capacity and inflight should have been zero but were not; both were reset"
            }
        }
    }
}

/// Events emitted by the batcher, rate limiters, and lease managers.
#[derive(Clone, Debug)]
pub enum Event {
    /// All control loops of a component have drained.
    Shutdown,
    /// Processing was paused for the given duration.
    Pause { duration: Duration },
    /// A pause expired.
    Resume,
    /// The audit found the accounting consistent.
    AuditPass,
    /// The audit found and corrected divergent accounting.
    AuditFail { reason: AuditFailure },
    /// The audit could not run because work was still in motion.
    AuditSkip,
    /// The batcher reported its needed capacity to the rate limiter.
    Request { capacity: u32 },
    /// A flush pass began.
    FlushStart,
    /// A flush pass ended.
    FlushDone,
    /// A batch was dispatched with this many operations.
    Batch { operations: u32 },
    /// A rate limiter recomputed its usable per-second capacity.
    Capacity { capacity: u32 },
    /// A partition lease attempt lost to another process.
    Failed { partition: u32 },
    /// A partition lease expired and the slot was returned.
    Released { partition: u32 },
    /// A partition lease was acquired.
    Allocated { partition: u32 },
    /// The shared limiter recorded a new capacity target.
    Target { capacity: u32 },
    /// A backend failure that the control loop absorbed.
    Error { message: String },
    /// Provisioning of the shared store began.
    ProvisionStart,
    /// Provisioning of the shared store completed.
    ProvisionDone,
    /// The lease container was created.
    CreatedContainer { container: String },
    /// The lease container already existed.
    VerifiedContainer { container: String },
    /// A partition blob was created.
    CreatedBlob { partition: u32 },
    /// A partition blob already existed.
    VerifiedBlob { partition: u32 },
}

impl Event {
    /// Canonical wire name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Pause { .. } => "pause",
            Self::Resume => "resume",
            Self::AuditPass => "audit-pass",
            Self::AuditFail { .. } => "audit-fail",
            Self::AuditSkip => "audit-skip",
            Self::Request { .. } => "request",
            Self::FlushStart => "flush-start",
            Self::FlushDone => "flush-done",
            Self::Batch { .. } => "batch",
            Self::Capacity { .. } => "capacity",
            Self::Failed { .. } => "failed",
            Self::Released { .. } => "released",
            Self::Allocated { .. } => "allocated",
            Self::Target { .. } => "target",
            Self::Error { .. } => "error",
            Self::ProvisionStart => "provision-start",
            Self::ProvisionDone => "provision-done",
            Self::CreatedContainer { .. } => "created-container",
            Self::VerifiedContainer { .. } => "verified-container",
            Self::CreatedBlob { .. } => "created-blob",
            Self::VerifiedBlob { .. } => "verified-blob",
        }
    }
}

/// Opaque handle identifying a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Multicast bus carrying [`Event`]s to registered listeners.
///
/// Cheap to clone; clones share the same listener table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    listeners: RwLock<HashMap<ListenerId, Listener>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener and returns the id that removes it.
    ///
    /// Listeners run synchronously on the emitting task and must not block.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .expect("listener table poisoned")
            .insert(id, Arc::new(listener));
        id
    }

    /// Removes a listener. Unknown ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        self.inner
            .listeners
            .write()
            .expect("listener table poisoned")
            .remove(&id);
    }

    pub(crate) fn emit(&self, event: &Event) {
        let listeners = self.inner.listeners.read().expect("listener table poisoned");
        for listener in listeners.values() {
            listener(event);
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .inner
            .listeners
            .read()
            .map(|l| l.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

/// Listener that logs every event through `tracing` at debug level.
pub fn tracing_listener() -> impl Fn(&Event) + Send + Sync + 'static {
    |event: &Event| debug!(name = event.name(), ?event, "engine event")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn emit_fans_out_to_every_listener() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            bus.add_listener(move |_| {
                seen.fetch_add(1, Ordering::Relaxed);
            });
        }
        bus.emit(&Event::Resume);
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn removed_listeners_stop_receiving() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let id = bus.add_listener(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        bus.emit(&Event::Resume);
        bus.remove_listener(id);
        bus.emit(&Event::Resume);
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn clones_share_the_listener_table() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        bus.clone().add_listener(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        bus.emit(&Event::AuditPass);
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn names_match_the_wire_contract() {
        assert_eq!(Event::Shutdown.name(), "shutdown");
        assert_eq!(
            Event::AuditFail {
                reason: AuditFailure::Target
            }
            .name(),
            "audit-fail"
        );
        assert_eq!(Event::FlushStart.name(), "flush-start");
        assert_eq!(Event::CreatedContainer { container: "x".into() }.name(), "created-container");
        assert_eq!(Event::VerifiedBlob { partition: 3 }.name(), "verified-blob");
    }
}
