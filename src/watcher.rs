//! Watchers are the sinks that receive dispatched batches.

use crate::operation::Operation;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A group of operations dispatched together to one watcher.
pub type Batch<P> = Vec<Arc<Operation<P>>>;

type BoxedCallback<P> =
    Box<dyn Fn(Batch<P>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A sink with an async callback that receives batches, plus per-sink policy.
///
/// Watchers are stateless across batches and may be shared by many
/// operations; wrap one in an [`Arc`] and hand it to each
/// [`Operation`](crate::Operation) that targets it.
pub struct Watcher<P> {
    on_ready: BoxedCallback<P>,
    max_attempts: Option<u32>,
    max_batch_size: Option<u32>,
    max_operation_time: Option<Duration>,
}

impl<P> Watcher<P> {
    /// Creates a watcher whose `on_ready` future runs once per dispatched
    /// batch, each on a fresh task.
    pub fn new<F, Fut>(on_ready: F) -> Self
    where
        F: Fn(Batch<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            on_ready: Box::new(move |batch| Box::pin(on_ready(batch))),
            max_attempts: None,
            max_batch_size: None,
            max_operation_time: None,
        }
    }

    /// Caps how many times any one operation targeting this watcher may be
    /// admitted.
    pub fn with_max_attempts(mut self, val: u32) -> Self {
        self.max_attempts = Some(val);
        self
    }

    /// Caps the number of operations packed into one batch.
    pub fn with_max_batch_size(mut self, val: u32) -> Self {
        self.max_batch_size = Some(val);
        self
    }

    /// Overrides the batcher-wide ceiling on how long this watcher's batches
    /// may hold capacity.
    pub fn with_max_operation_time(mut self, val: Duration) -> Self {
        self.max_operation_time = Some(val);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn max_batch_size(&self) -> Option<u32> {
        self.max_batch_size
    }

    pub fn max_operation_time(&self) -> Option<Duration> {
        self.max_operation_time
    }

    /// Runs the callback for one batch.
    pub(crate) fn process_batch(&self, batch: Batch<P>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        (self.on_ready)(batch)
    }
}

impl<P> fmt::Debug for Watcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("max_attempts", &self.max_attempts)
            .field("max_batch_size", &self.max_batch_size)
            .field("max_operation_time", &self.max_operation_time)
            .finish_non_exhaustive()
    }
}
