//! The batching scheduler.
//!
//! A [`Batcher`] admits cost-bearing operations into a bounded buffer and
//! runs three periodic loops once started:
//!
//! - the **flush loop** drains the buffer into per-watcher batches within
//!   the current timeslice's token budget and dispatches each batch on a
//!   fresh task;
//! - the **capacity loop** reports the outstanding cost to the rate
//!   limiter;
//! - the **audit loop** detects and corrects drift in the accounting
//!   counters.
//!
//! `Batcher` is a cheap cloneable handle; clones share all state.

mod audit;
mod flush;

use crate::buffer::Buffer;
use crate::config::{
    DEFAULT_AUDIT_INTERVAL, DEFAULT_BUFFER_SIZE, DEFAULT_CAPACITY_INTERVAL,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_OPERATION_TIME, DEFAULT_PAUSE_TIME, MIN_FLUSH_INTERVAL,
};
use crate::error::BatcherError;
use crate::events::{Event, EventBus, ListenerId};
use crate::lifecycle::{Phase, PhaseCell};
use crate::limiter::RateLimiter;
use crate::operation::Operation;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Scheduler that drains enqueued operations into watcher batches at the
/// pace the rate limiter allows.
pub struct Batcher<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for Batcher<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

pub(crate) struct Shared<P> {
    pub(crate) buffer: Buffer<P>,
    pub(crate) events: EventBus,
    pub(crate) config: RwLock<BatcherConfig>,
    pub(crate) phase: PhaseCell,
    /// Total cost of operations admitted but not yet retired.
    pub(crate) needs_capacity: AtomicU32,
    /// Batches currently dispatched and not yet retired.
    pub(crate) inflight: AtomicU32,
    /// Milliseconds since `epoch` of the most recent dispatch.
    last_dispatch: AtomicU64,
    epoch: Instant,
    pause_until: Mutex<Option<Instant>>,
    pub(crate) flush_wakeup: Notify,
    pub(crate) flush_gate: tokio::sync::Mutex<()>,
    stop: Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
pub(crate) struct BatcherConfig {
    pub(crate) error_on_full_buffer: bool,
    pub(crate) rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub(crate) flush_interval: Duration,
    pub(crate) capacity_interval: Duration,
    pub(crate) audit_interval: Duration,
    pub(crate) max_operation_time: Duration,
    pub(crate) pause_time: Duration,
    pub(crate) max_concurrent_batches: Option<u32>,
    pub(crate) emit_request: bool,
    pub(crate) emit_flush: bool,
    pub(crate) emit_batch: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            error_on_full_buffer: false,
            rate_limiter: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            capacity_interval: DEFAULT_CAPACITY_INTERVAL,
            audit_interval: DEFAULT_AUDIT_INTERVAL,
            max_operation_time: DEFAULT_MAX_OPERATION_TIME,
            pause_time: DEFAULT_PAUSE_TIME,
            max_concurrent_batches: None,
            emit_request: false,
            emit_flush: false,
            emit_batch: false,
        }
    }
}

impl<P: Send + Sync + 'static> Batcher<P> {
    /// Creates a batcher with the default buffer size.
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER_SIZE)
    }

    /// Creates a batcher whose admission buffer holds `size` operations.
    pub fn with_buffer(size: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: Buffer::new(size),
                events: EventBus::new(),
                config: RwLock::new(BatcherConfig::default()),
                phase: PhaseCell::new(),
                needs_capacity: AtomicU32::new(0),
                inflight: AtomicU32::new(0),
                last_dispatch: AtomicU64::new(0),
                epoch: Instant::now(),
                pause_until: Mutex::new(None),
                flush_wakeup: Notify::new(),
                flush_gate: tokio::sync::Mutex::new(()),
                stop: Mutex::new(None),
            }),
        }
    }

    /// Supplies the rate limiter that paces dispatch. Without one, capacity
    /// is treated as unlimited.
    pub fn with_rate_limiter(self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.configure(move |cfg| cfg.rate_limiter = Some(limiter));
        self
    }

    /// Switches a full-buffer enqueue from blocking to failing.
    pub fn with_error_on_full_buffer(self) -> Self {
        self.configure(|cfg| cfg.error_on_full_buffer = true);
        self
    }

    /// Sets the flush-loop cadence. Anything under 1 ms reverts to the
    /// 100 ms default.
    pub fn with_flush_interval(self, interval: Duration) -> Self {
        self.configure(move |cfg| {
            cfg.flush_interval = if interval < MIN_FLUSH_INTERVAL {
                DEFAULT_FLUSH_INTERVAL
            } else {
                interval
            };
        });
        self
    }

    /// Sets how often the outstanding cost is reported to the rate limiter.
    pub fn with_capacity_interval(self, interval: Duration) -> Self {
        self.configure(move |cfg| {
            cfg.capacity_interval = if interval.is_zero() {
                DEFAULT_CAPACITY_INTERVAL
            } else {
                interval
            };
        });
        self
    }

    /// Sets the audit-sweep cadence.
    pub fn with_audit_interval(self, interval: Duration) -> Self {
        self.configure(move |cfg| {
            cfg.audit_interval = if interval.is_zero() {
                DEFAULT_AUDIT_INTERVAL
            } else {
                interval
            };
        });
        self
    }

    /// Sets the batcher-wide ceiling on how long a dispatched batch may
    /// hold capacity. Watchers can override it per sink.
    pub fn with_max_operation_time(self, time: Duration) -> Self {
        self.configure(move |cfg| {
            cfg.max_operation_time = if time.is_zero() {
                DEFAULT_MAX_OPERATION_TIME
            } else {
                time
            };
        });
        self
    }

    /// Sets how long a pause lasts. Zero reverts to the 500 ms default.
    pub fn with_pause_time(self, time: Duration) -> Self {
        self.configure(move |cfg| {
            cfg.pause_time = if time.is_zero() {
                DEFAULT_PAUSE_TIME
            } else {
                time
            };
        });
        self
    }

    /// Caps the number of batches in flight at once.
    pub fn with_max_concurrent_batches(self, max: u32) -> Self {
        self.configure(move |cfg| cfg.max_concurrent_batches = Some(max));
        self
    }

    /// Emits a `request` event on every capacity-loop tick. High volume.
    pub fn with_emit_request(self) -> Self {
        self.configure(|cfg| cfg.emit_request = true);
        self
    }

    /// Emits `flush-start`/`flush-done` around every pass. High volume.
    pub fn with_emit_flush(self) -> Self {
        self.configure(|cfg| cfg.emit_flush = true);
        self
    }

    /// Emits a `batch` event per dispatch. Unsafe for production volume.
    pub fn with_emit_batch(self) -> Self {
        self.configure(|cfg| cfg.emit_batch = true);
        self
    }

    fn configure(&self, apply: impl FnOnce(&mut BatcherConfig)) {
        if self.shared.phase.current() != Phase::Uninitialized {
            panic!("{}", BatcherError::InitializationOnly);
        }
        apply(&mut self.shared.config.write().expect("config lock poisoned"));
    }

    /// Registers an observability listener.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.events.add_listener(listener)
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.shared.events.remove_listener(id);
    }

    /// Admits an operation.
    ///
    /// Admission is allowed before [`start`](Batcher::start); buffered work
    /// queues up until the loops run. In the default blocking mode the call
    /// waits for a buffer slot; with
    /// [`with_error_on_full_buffer`](Batcher::with_error_on_full_buffer) it
    /// fails immediately instead.
    pub async fn enqueue(&self, op: Arc<Operation<P>>) -> Result<(), BatcherError> {
        let (limiter, error_on_full) = {
            let cfg = self.shared.config.read().expect("config lock poisoned");
            (cfg.rate_limiter.clone(), cfg.error_on_full_buffer)
        };
        if let Some(limiter) = limiter {
            if op.cost() > limiter.max_capacity() {
                return Err(BatcherError::TooExpensive);
            }
        }
        if let Some(max) = op.watcher().max_attempts() {
            if max > 0 && op.attempt() >= max {
                return Err(BatcherError::TooManyAttempts);
            }
        }
        if !op.try_mark_buffered() {
            return Err(BatcherError::AlreadyEnqueued);
        }
        if let Err(err) = self.shared.buffer.enqueue(op.clone(), error_on_full).await {
            op.clear_buffered();
            return Err(err);
        }
        op.make_attempt();
        self.shared.add_needs_capacity(op.cost());
        Ok(())
    }

    /// Starts the flush, capacity, and audit loops. Cancelling `shutdown`
    /// (or calling [`stop`](Batcher::stop)) ends them; a `shutdown` event
    /// is emitted once all three have drained.
    pub fn start(&self, shutdown: CancellationToken) -> Result<(), BatcherError> {
        if !self.shared.phase.advance(Phase::Uninitialized, Phase::Started) {
            return Err(BatcherError::ImproperOrder);
        }
        let cfg = Arc::new(
            self.shared
                .config
                .read()
                .expect("config lock poisoned")
                .clone(),
        );
        let slots = cfg
            .max_concurrent_batches
            .map(|max| Arc::new(Semaphore::new(max as usize)));
        let stop = shutdown.child_token();
        *self.shared.stop.lock().expect("stop token poisoned") = Some(stop.clone());

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::join!(
                shared.clone().flush_loop(cfg.clone(), slots, stop.clone()),
                shared.clone().capacity_loop(cfg.clone(), stop.clone()),
                shared.clone().audit_loop(cfg, stop),
            );
            shared.events.emit(&Event::Shutdown);
            debug!("batcher loops drained");
        });
        Ok(())
    }

    /// Ends the loops. Idempotent; inflight batches complete naturally,
    /// still bounded by their operation-time timers.
    pub fn stop(&self) {
        if self.shared.phase.current() == Phase::Stopped {
            return;
        }
        if let Some(stop) = self.shared.stop.lock().expect("stop token poisoned").take() {
            stop.cancel();
        }
        self.shared.phase.set(Phase::Stopped);
    }

    /// Triggers an immediate flush pass. Passes never overlap; a trigger
    /// that lands while one is running coalesces into the next.
    pub fn flush(&self) {
        self.shared.flush_wakeup.notify_one();
    }

    /// Pauses all three loops until `pause_time` from now. Pausing while
    /// already paused does not extend the deadline.
    pub fn pause(&self) {
        let pause_time = self
            .shared
            .config
            .read()
            .expect("config lock poisoned")
            .pause_time;
        let deadline = {
            let mut pause_until = self.shared.pause_until.lock().expect("pause lock poisoned");
            let now = Instant::now();
            if let Some(deadline) = *pause_until {
                if deadline > now {
                    return;
                }
            }
            let deadline = now + pause_time;
            *pause_until = Some(deadline);
            deadline
        };
        self.shared.events.emit(&Event::Pause {
            duration: pause_time,
        });
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline.into()).await;
            shared.events.emit(&Event::Resume);
        });
    }

    /// Total cost of operations admitted but not yet retired.
    pub fn needs_capacity(&self) -> u32 {
        self.shared.needs_capacity.load(Ordering::Relaxed)
    }

    /// Number of operations waiting in the buffer.
    pub fn operations_in_buffer(&self) -> u32 {
        self.shared.buffer.size()
    }

    /// Number of batches currently in flight.
    pub fn inflight(&self) -> u32 {
        self.shared.inflight.load(Ordering::Relaxed)
    }
}

impl<P: Send + Sync + 'static> Default for Batcher<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Send + Sync + 'static> Shared<P> {
    pub(crate) async fn capacity_loop(
        self: Arc<Self>,
        cfg: Arc<BatcherConfig>,
        stop: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + cfg.capacity_interval,
            cfg.capacity_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.wait_if_paused().await;
            let needed = self.needs_capacity.load(Ordering::Relaxed);
            if let Some(limiter) = cfg.rate_limiter.as_ref() {
                limiter.give_me(needed);
            }
            if cfg.emit_request {
                self.events.emit(&Event::Request { capacity: needed });
            }
        }
        debug!("capacity loop stopped");
    }

    pub(crate) async fn wait_if_paused(&self) {
        loop {
            let deadline = *self.pause_until.lock().expect("pause lock poisoned");
            match deadline {
                Some(deadline) if deadline > Instant::now() => {
                    tokio::time::sleep_until(deadline.into()).await;
                }
                _ => return,
            }
        }
    }

    pub(crate) fn add_needs_capacity(&self, cost: u32) {
        self.needs_capacity
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_add(cost))
            })
            .ok();
    }

    pub(crate) fn sub_needs_capacity(&self, cost: u32) {
        self.needs_capacity
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(cost))
            })
            .ok();
    }

    /// Retires one batch. Saturating: the audit may already have reset the
    /// counter while this batch was still running.
    pub(crate) fn sub_inflight(&self) {
        self.inflight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            })
            .ok();
    }

    pub(crate) fn mark_dispatch(&self) {
        self.last_dispatch
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn since_last_dispatch(&self) -> Duration {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(elapsed.saturating_sub(self.last_dispatch.load(Ordering::Relaxed)))
    }
}
