//! The flush pass: packs buffered operations into per-watcher batches
//! within the timeslice's token budget and dispatches them.

use super::{BatcherConfig, Shared};
use crate::events::Event;
use crate::operation::Operation;
use crate::watcher::Watcher;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A per-watcher batch still being filled during a pass. The slot permit
/// (when concurrency is capped) is held from the moment the batch opens.
struct PendingBatch<P> {
    operations: Vec<Arc<Operation<P>>>,
    slot: Option<OwnedSemaphorePermit>,
}

/// Watchers have no identity beyond their allocation, so pending batches
/// are keyed by the address of the shared watcher.
fn watcher_key<P>(watcher: &Arc<Watcher<P>>) -> usize {
    Arc::as_ptr(watcher) as usize
}

impl<P: Send + Sync + 'static> Shared<P> {
    pub(crate) async fn flush_loop(
        self: Arc<Self>,
        cfg: Arc<BatcherConfig>,
        slots: Option<Arc<Semaphore>>,
        stop: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + cfg.flush_interval,
            cfg.flush_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.flush_wakeup.notified() => {}
            }
            self.wait_if_paused().await;
            self.flush_pass(&cfg, slots.as_ref()).await;
        }
        debug!("flush loop stopped");
    }

    /// Runs one pass over the buffer.
    ///
    /// Tokens for the pass are the limiter's per-second capacity scaled to
    /// the flush interval; without a limiter the budget is unbounded. The
    /// pass walks head-to-tail: an operation that does not fit the
    /// remaining budget is skipped in place so cheaper operations behind it
    /// still make progress, and the pass stops early only when a new batch
    /// would be needed while every inflight slot is taken.
    pub(crate) async fn flush_pass(
        self: &Arc<Self>,
        cfg: &BatcherConfig,
        slots: Option<&Arc<Semaphore>>,
    ) {
        // Coalesce: a trigger landing while a pass runs folds into the next.
        let Ok(_gate) = self.flush_gate.try_lock() else {
            return;
        };
        if cfg.emit_flush {
            self.events.emit(&Event::FlushStart);
        }

        let mut tokens = cfg.rate_limiter.as_ref().map(|limiter| {
            u64::from(limiter.capacity()) * cfg.flush_interval.as_millis() as u64 / 1_000
        });
        let mut pending: HashMap<usize, PendingBatch<P>> = HashMap::new();

        let mut current = self.buffer.top();
        while let Some(op) = current {
            let cost = u64::from(op.cost());
            if let Some(remaining) = tokens {
                if cost > remaining {
                    trace!(cost, remaining, "operation does not fit this pass");
                    current = self.buffer.skip();
                    continue;
                }
            }

            let watcher = op.watcher().clone();
            let key = watcher_key(&watcher);
            let opens_batch = !op.batchable() || !pending.contains_key(&key);
            let slot = if opens_batch {
                match slots {
                    Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        // Every slot is busy; nothing more can dispatch.
                        Err(_) => break,
                    },
                    None => None,
                }
            } else {
                None
            };

            current = self.buffer.remove();
            if let Some(remaining) = tokens.as_mut() {
                *remaining -= cost;
            }

            if !op.batchable() {
                self.dispatch(cfg, vec![op], slot);
            } else {
                let batch = pending.entry(key).or_insert_with(|| PendingBatch {
                    operations: Vec::new(),
                    slot,
                });
                batch.operations.push(op);
                if let Some(max) = watcher.max_batch_size() {
                    if batch.operations.len() as u32 >= max {
                        let full = pending.remove(&key).expect("pending batch just filled");
                        self.dispatch(cfg, full.operations, full.slot);
                    }
                }
            }
        }

        for (_, batch) in pending {
            self.dispatch(cfg, batch.operations, batch.slot);
        }
        if cfg.emit_flush {
            self.events.emit(&Event::FlushDone);
        }
    }

    /// Hands one batch to its watcher on a fresh task.
    ///
    /// The admitted cost is released when the callback returns or when the
    /// operation-time ceiling fires, whichever comes first; the other path
    /// is a no-op. A callback that outlives the ceiling keeps running
    /// detached, and a panicking callback is contained by its task.
    pub(crate) fn dispatch(
        self: &Arc<Self>,
        cfg: &BatcherConfig,
        operations: Vec<Arc<Operation<P>>>,
        slot: Option<OwnedSemaphorePermit>,
    ) {
        let Some(first) = operations.first() else {
            return;
        };
        let watcher = first.watcher().clone();
        let cost = operations
            .iter()
            .fold(0u32, |acc, op| acc.saturating_add(op.cost()));
        let max_operation_time = watcher
            .max_operation_time()
            .unwrap_or(cfg.max_operation_time);

        self.inflight.fetch_add(1, Ordering::Relaxed);
        self.mark_dispatch();
        if cfg.emit_batch {
            self.events.emit(&Event::Batch {
                operations: operations.len() as u32,
            });
        }
        trace!(
            operations = operations.len(),
            cost,
            "dispatching batch"
        );

        let shared = self.clone();
        tokio::spawn(async move {
            let callback = tokio::spawn(watcher.process_batch(operations));
            tokio::select! {
                _ = callback => {}
                _ = tokio::time::sleep(max_operation_time) => {
                    trace!("batch exceeded its operation time; accounting released");
                }
            }
            shared.sub_needs_capacity(cost);
            shared.sub_inflight();
            drop(slot);
        });
    }
}
