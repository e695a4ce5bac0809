// packages/engine/src/queue.rs
//! Bounded drop-oldest queue
//!
//! Lock-free MPMC queue used for agent output queues and for batches waiting
//! on the rate limiter. When full, a push evicts the oldest element instead of
//! rejecting the newest one, so consumers always see the freshest data.
//!
//! Accounting invariant:
//!
//! ```text
//! pushed = popped + dropped + discarded + len
//! ```

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Bounded queue that evicts the oldest element on overflow
pub struct DropOldestQueue<T> {
    queue: ArrayQueue<T>,

    /// Signalled on every push; may be shared by several queues
    ready: Arc<Notify>,

    /// Signalled when a pop empties the queue
    drained: Notify,

    push_count: AtomicU64,
    pop_count: AtomicU64,

    /// Elements evicted by a push into a full queue
    drop_count: AtomicU64,

    /// Elements thrown away by `discard_all`
    discard_count: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    /// Create a queue with its own ready notifier
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero (rejected earlier by config validation).
    pub fn new(capacity: usize) -> Self {
        Self::with_notify(capacity, Arc::new(Notify::new()))
    }

    /// Create a queue that signals `ready` on every push
    pub fn with_notify(capacity: usize, ready: Arc<Notify>) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            ready,
            drained: Notify::new(),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
            discard_count: AtomicU64::new(0),
        }
    }

    /// Push an element, returning the evicted oldest element if the queue was full
    pub fn push(&self, item: T) -> Option<T> {
        self.push_count.fetch_add(1, Ordering::Relaxed);
        let evicted = self.queue.force_push(item);
        if evicted.is_some() {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    /// Try to pop the oldest element (non-blocking)
    pub fn try_pop(&self) -> Option<T> {
        let item = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        if self.queue.is_empty() {
            self.drained.notify_waiters();
        }
        Some(item)
    }

    /// Throw away everything still queued; returns the number discarded
    pub fn discard_all(&self) -> u64 {
        let mut discarded = 0;
        while self.queue.pop().is_some() {
            discarded += 1;
        }
        self.discard_count.fetch_add(discarded, Ordering::Relaxed);
        self.drained.notify_waiters();
        discarded
    }

    /// Wait until the queue is empty or `timeout` elapses. Returns `true` if drained.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.queue.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Notifier signalled on push
    pub fn ready(&self) -> &Arc<Notify> {
        &self.ready
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            discard_count: self.discard_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Total elements pushed
    pub push_count: u64,

    /// Total elements popped by the consumer
    pub pop_count: u64,

    /// Total elements evicted by overflow
    pub drop_count: u64,

    /// Total elements discarded on stop
    pub discard_count: u64,

    pub current_size: usize,
    pub capacity: usize,
}
