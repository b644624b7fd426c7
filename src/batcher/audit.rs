//! Periodic consistency audit of the accounting counters.
//!
//! `needs_capacity` and `inflight` are updated with atomics from many
//! paths; the audit is the guard that catches and corrects drift. It only
//! judges the counters when the engine is demonstrably quiet: an empty
//! buffer, and long enough since the last dispatch that every batch has
//! either returned or had its timer fire.

use super::{BatcherConfig, Shared};
use crate::events::{AuditFailure, Event};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

impl<P: Send + Sync + 'static> Shared<P> {
    pub(crate) async fn audit_loop(
        self: Arc<Self>,
        cfg: Arc<BatcherConfig>,
        stop: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + cfg.audit_interval,
            cfg.audit_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.wait_if_paused().await;
            self.audit(&cfg);
        }
        debug!("audit loop stopped");
    }

    fn audit(&self, cfg: &BatcherConfig) {
        if self.buffer.size() > 0 || self.since_last_dispatch() < cfg.max_operation_time {
            self.events.emit(&Event::AuditSkip);
            return;
        }

        let target_ok = self.needs_capacity.load(Ordering::Relaxed) == 0;
        // Inflight is only budgeted (and therefore only judged) when a
        // concurrency cap is configured.
        let inflight_ok = cfg.max_concurrent_batches.is_none()
            || self.inflight.load(Ordering::Relaxed) == 0;
        let reason = match (target_ok, inflight_ok) {
            (true, true) => {
                self.events.emit(&Event::AuditPass);
                return;
            }
            (false, true) => {
                self.needs_capacity.store(0, Ordering::Relaxed);
                AuditFailure::Target
            }
            (true, false) => {
                self.inflight.store(0, Ordering::Relaxed);
                AuditFailure::Inflight
            }
            (false, false) => {
                self.needs_capacity.store(0, Ordering::Relaxed);
                self.inflight.store(0, Ordering::Relaxed);
                AuditFailure::TargetAndInflight
            }
        };
        warn!(reason = reason.message(), "audit corrected accounting drift");
        self.events.emit(&Event::AuditFail { reason });
    }
}
