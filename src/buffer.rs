//! Bounded admission buffer with cursor-based traversal.
//!
//! Capacity is enforced with a semaphore: a blocking enqueue waits for a
//! slot to free, the failing variant gives up immediately. Permits are
//! forgotten on insert and returned on removal, so the semaphore always
//! mirrors the free space.
//!
//! Traversal is non-destructive: a consumer walks the buffer with
//! [`top`](Buffer::top)/[`skip`](Buffer::skip)/[`remove`](Buffer::remove),
//! keeping items it cannot use yet. Exactly one traversal may be in
//! progress at a time; the flush pass owns this discipline.

use crate::error::BatcherError;
use crate::operation::Operation;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Bounded FIFO of pending operations.
pub struct Buffer<P> {
    max: u32,
    size: AtomicU32,
    slots: Arc<Semaphore>,
    inner: Mutex<Cursor<P>>,
}

struct Cursor<P> {
    items: VecDeque<Arc<Operation<P>>>,
    position: usize,
}

impl<P> Buffer<P> {
    /// Creates a buffer holding at most `max` operations.
    pub fn new(max: u32) -> Self {
        Self {
            max,
            size: AtomicU32::new(0),
            slots: Arc::new(Semaphore::new(max as usize)),
            inner: Mutex::new(Cursor {
                items: VecDeque::new(),
                position: 0,
            }),
        }
    }

    /// Appends an operation.
    ///
    /// With `error_on_full` the call fails immediately when no slot is
    /// free; otherwise it waits until one is.
    pub async fn enqueue(
        &self,
        op: Arc<Operation<P>>,
        error_on_full: bool,
    ) -> Result<(), BatcherError> {
        let permit = if error_on_full {
            match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return Err(BatcherError::BufferFull),
            }
        } else {
            self.slots
                .clone()
                .acquire_owned()
                .await
                .expect("buffer semaphore closed")
        };
        permit.forget();
        let mut cursor = self.inner.lock().expect("buffer lock poisoned");
        cursor.items.push_back(op);
        self.size.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Resets the cursor to the head and returns the operation there.
    pub fn top(&self) -> Option<Arc<Operation<P>>> {
        let mut cursor = self.inner.lock().expect("buffer lock poisoned");
        cursor.position = 0;
        cursor.items.front().cloned()
    }

    /// Keeps the current operation in place and returns the one after it.
    pub fn skip(&self) -> Option<Arc<Operation<P>>> {
        let mut cursor = self.inner.lock().expect("buffer lock poisoned");
        if cursor.position < cursor.items.len() {
            cursor.position += 1;
        }
        cursor.items.get(cursor.position).cloned()
    }

    /// Evicts the current operation and returns the one now under the
    /// cursor. Frees the evicted operation for re-enqueueing.
    pub fn remove(&self) -> Option<Arc<Operation<P>>> {
        let mut cursor = self.inner.lock().expect("buffer lock poisoned");
        let position = cursor.position;
        if let Some(removed) = cursor.items.remove(position) {
            removed.clear_buffered();
            self.size.fetch_sub(1, Ordering::Relaxed);
            self.slots.add_permits(1);
        }
        cursor.items.get(cursor.position).cloned()
    }

    /// Drops every pending operation and frees their slots.
    pub fn clear(&self) {
        let mut cursor = self.inner.lock().expect("buffer lock poisoned");
        let drained = cursor.items.len();
        for op in cursor.items.drain(..) {
            op.clear_buffered();
        }
        cursor.position = 0;
        self.size.fetch_sub(drained as u32, Ordering::Relaxed);
        self.slots.add_permits(drained);
    }

    /// Number of operations currently held.
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Relaxed)
    }

    /// Maximum number of operations this buffer can hold.
    pub fn max(&self) -> u32 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::{Batch, Watcher};
    use std::time::Duration;

    fn noop_watcher() -> Arc<Watcher<()>> {
        Arc::new(Watcher::new(|_: Batch<()>| async {}))
    }

    fn op() -> Arc<Operation<()>> {
        Operation::new(noop_watcher(), 0, (), false)
    }

    #[tokio::test]
    async fn starts_empty() {
        let buffer: Buffer<()> = Buffer::new(10);
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.max(), 10);
        assert!(buffer.top().is_none());
    }

    #[tokio::test]
    async fn fails_fast_when_full() {
        let buffer = Buffer::new(1);
        buffer.enqueue(op(), true).await.unwrap();
        let err = buffer.enqueue(op(), true).await.unwrap_err();
        assert_eq!(err, BatcherError::BufferFull);
    }

    #[tokio::test]
    async fn blocks_when_full() {
        let buffer = Arc::new(Buffer::new(1));
        buffer.enqueue(op(), false).await.unwrap();
        let second = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.enqueue(op(), false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "enqueue should still be waiting");
        buffer.top();
        buffer.remove();
        second.await.unwrap().unwrap();
        assert_eq!(buffer.size(), 1);
    }

    #[tokio::test]
    async fn skip_keeps_items_and_advances() {
        let buffer = Buffer::new(10);
        let op1 = op();
        let op2 = op();
        buffer.enqueue(op1.clone(), false).await.unwrap();
        buffer.enqueue(op2.clone(), false).await.unwrap();

        assert!(Arc::ptr_eq(&buffer.top().unwrap(), &op1));
        assert!(Arc::ptr_eq(&buffer.skip().unwrap(), &op2));
        assert!(buffer.skip().is_none());
        assert_eq!(buffer.size(), 2);
    }

    #[tokio::test]
    async fn remove_evicts_and_returns_the_next() {
        let buffer = Buffer::new(10);
        let op1 = op();
        let op2 = op();
        buffer.enqueue(op1.clone(), false).await.unwrap();
        buffer.enqueue(op2.clone(), false).await.unwrap();

        assert!(Arc::ptr_eq(&buffer.top().unwrap(), &op1));
        assert!(Arc::ptr_eq(&buffer.remove().unwrap(), &op2));
        assert_eq!(buffer.size(), 1);
        assert!(buffer.remove().is_none());
        assert_eq!(buffer.size(), 0);
    }

    #[tokio::test]
    async fn removal_frees_the_operation_for_reenqueue() {
        let buffer = Buffer::new(10);
        let op1 = op();
        assert!(op1.try_mark_buffered());
        buffer.enqueue(op1.clone(), false).await.unwrap();
        buffer.top();
        buffer.remove();
        assert!(op1.try_mark_buffered(), "removal should release the slot claim");
    }

    #[tokio::test]
    async fn clear_empties_the_buffer_and_frees_slots() {
        let buffer = Buffer::new(2);
        buffer.enqueue(op(), false).await.unwrap();
        buffer.enqueue(op(), false).await.unwrap();
        buffer.clear();
        assert_eq!(buffer.size(), 0);
        assert!(buffer.top().is_none());
        // Slots are free again.
        buffer.enqueue(op(), true).await.unwrap();
        buffer.enqueue(op(), true).await.unwrap();
    }
}
