//! The unit of work callers enqueue.

use crate::watcher::Watcher;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// A caller-submitted work item bearing a cost and a payload, destined for
/// a specific watcher.
///
/// Operations are shared via [`Arc`]: the caller keeps a handle (to inspect
/// attempts or re-enqueue after delivery), the buffer holds one while the
/// operation is pending, and the watcher receives one inside its batch. An
/// operation can sit in the buffer at most once at a time; re-enqueueing it
/// is only possible after its batch has been dispatched.
pub struct Operation<P> {
    watcher: Arc<Watcher<P>>,
    cost: u32,
    payload: P,
    batchable: bool,
    attempt: AtomicU32,
    buffered: AtomicBool,
}

impl<P> Operation<P> {
    /// Creates an operation targeting `watcher`, worth `cost` capacity.
    ///
    /// Non-batchable operations are always dispatched as singleton batches.
    pub fn new(watcher: Arc<Watcher<P>>, cost: u32, payload: P, batchable: bool) -> Arc<Self> {
        Arc::new(Self {
            watcher,
            cost,
            payload,
            batchable,
            attempt: AtomicU32::new(0),
            buffered: AtomicBool::new(false),
        })
    }

    pub fn watcher(&self) -> &Arc<Watcher<P>> {
        &self.watcher
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn batchable(&self) -> bool {
        self.batchable
    }

    /// Number of times this operation has been admitted.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }

    pub(crate) fn make_attempt(&self) {
        self.attempt.fetch_add(1, Ordering::Relaxed);
    }

    /// Claims the single in-buffer slot; false when already enqueued.
    pub(crate) fn try_mark_buffered(&self) -> bool {
        self.buffered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_buffered(&self) {
        self.buffered.store(false, Ordering::Release);
    }
}

impl<P> fmt::Debug for Operation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("cost", &self.cost)
            .field("batchable", &self.batchable)
            .field("attempt", &self.attempt.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
