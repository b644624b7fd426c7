//! Lifecycle phase tracking shared by the batcher and the rate limiters.
//!
//! Phases only ever move forward. Any out-of-order call is reported to the
//! caller rather than silently reordered.

use std::sync::Mutex;

/// Phases a long-lived component moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    Uninitialized,
    Provisioned,
    Started,
    Stopped,
}

/// Mutex-guarded phase cell validating monotonic transitions.
#[derive(Debug)]
pub(crate) struct PhaseCell {
    phase: Mutex<Phase>,
}

impl PhaseCell {
    pub(crate) fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Uninitialized),
        }
    }

    pub(crate) fn current(&self) -> Phase {
        *self.phase.lock().expect("phase lock poisoned")
    }

    /// Moves `from` to `to`. Returns false (and leaves the phase untouched)
    /// when the component is not currently in `from`.
    pub(crate) fn advance(&self, from: Phase, to: Phase) -> bool {
        let mut phase = self.phase.lock().expect("phase lock poisoned");
        if *phase != from {
            return false;
        }
        *phase = to;
        true
    }

    /// Forces the phase, used by terminal transitions such as stop.
    pub(crate) fn set(&self, to: Phase) {
        *self.phase.lock().expect("phase lock poisoned") = to;
    }
}
