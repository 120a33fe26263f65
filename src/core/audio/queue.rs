//! Bounded hand-off between a hardware-facing thread and an async task.
//!
//! The producer never blocks: when the queue is full the oldest item is
//! discarded and counted. The consumer awaits items without polling.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

/// Drop-oldest bounded queue. Clones share the same buffer.
pub struct FrameQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FrameQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue without blocking. Returns `true` if an older item was evicted.
    /// Items pushed after `close` are discarded.
    pub fn push(&self, item: T) -> bool {
        if self.is_closed() {
            return false;
        }
        let evicted = {
            let mut items = self.inner.items.lock();
            let evicted = if items.len() >= self.inner.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(item);
            evicted
        };
        if evicted {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.notify.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.items.lock().pop_front()
    }

    /// Wait for the next item. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Items evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}
