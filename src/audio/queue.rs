//! Bounded FIFO queue with a per-instance overflow policy
//!
//! This is the buffering primitive every stage of the engine is built on:
//! both fan-out branches (drop-oldest, recency wins) and the playback buffer
//! (backpressure, nothing already enqueued is ever dropped).
//!
//! Each queue has a single producer and a single consumer. The controller may
//! additionally `clear()`/`retain()` during a flush.
//!
//! # Memory Budget
//!
//! At 16kHz mono PCM16 with 256-sample frames:
//! - Frame size: 256 samples × 2 bytes = 512 bytes
//! - 256 frames (~4s): 128 KB per fan-out branch

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// What happens when a push finds the queue full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest item and admit the new one
    DropOldest,
    /// Refuse the new item; async producers wait for space
    Backpressure,
}

/// Result of a non-blocking push
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// Admitted without displacing anything
    Accepted,
    /// Admitted; the returned oldest item was evicted to make room
    Evicted(T),
    /// Not admitted (queue full under backpressure, or closed)
    Rejected(T),
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Bounded FIFO queue
#[derive(Debug)]
pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    item_ready: Notify,
    space_ready: Notify,
}

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            capacity,
            policy,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push without waiting, applying the overflow policy if full
    pub fn push(&self, item: T) -> PushOutcome<T> {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Rejected(item);
            }

            if inner.items.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let evicted = inner.items.pop_front();
                        inner.items.push_back(item);
                        inner.dropped += 1;
                        match evicted {
                            Some(old) => PushOutcome::Evicted(old),
                            None => PushOutcome::Accepted,
                        }
                    }
                    OverflowPolicy::Backpressure => return PushOutcome::Rejected(item),
                }
            } else {
                inner.items.push_back(item);
                PushOutcome::Accepted
            }
        };

        self.item_ready.notify_one();
        outcome
    }

    /// Push, waiting for space when the queue applies backpressure.
    ///
    /// Returns the item back if the queue is closed.
    pub async fn push_wait(&self, item: T) -> Result<(), T> {
        let mut item = item;
        loop {
            match self.push(item) {
                PushOutcome::Accepted | PushOutcome::Evicted(_) => return Ok(()),
                PushOutcome::Rejected(rejected) => {
                    if self.is_closed() {
                        return Err(rejected);
                    }
                    item = rejected;
                }
            }
            self.space_ready.notified().await;
        }
    }

    /// Pop the oldest item, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.space_ready.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.item_ready.notified().await;
        }
    }

    /// Pop the oldest item if one is available
    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.space_ready.notify_one();
        }
        item
    }

    /// Discard everything buffered, returning how many items were removed
    pub fn clear(&self) -> usize {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.items.len();
            inner.items.clear();
            removed
        };
        self.space_ready.notify_one();
        removed
    }

    /// Keep only items matching `keep`, returning how many were removed
    pub fn retain<F>(&self, keep: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let removed = {
            let mut inner = self.lock();
            let before = inner.items.len();
            inner.items.retain(keep);
            before - inner.items.len()
        };
        self.space_ready.notify_one();
        removed
    }

    /// Close the queue, waking any waiting producer or consumer
    pub fn close(&self) {
        self.lock().closed = true;
        self.item_ready.notify_waiters();
        self.item_ready.notify_one();
        self.space_ready.notify_waiters();
        self.space_ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of items currently buffered
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Total items evicted by the drop-oldest policy
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_queue_push_and_len() {
        let queue = FrameQueue::new(4, OverflowPolicy::DropOldest);

        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);

        assert_eq!(queue.push(1), PushOutcome::Accepted);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.push(2), PushOutcome::Accepted);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drop_oldest_eviction() {
        let queue = FrameQueue::new(5, OverflowPolicy::DropOldest);

        for i in 0..7 {
            queue.push(i);
            assert!(queue.len() <= queue.capacity());
        }

        // Should only have 5 items (oldest 2 evicted)
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.dropped(), 2);

        // Retained items keep their order
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_eviction_returns_oldest() {
        let queue = FrameQueue::new(2, OverflowPolicy::DropOldest);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.push("c"), PushOutcome::Evicted("a"));
    }

    #[test]
    fn test_capacity_invariant_under_mixed_ops() {
        let queue = FrameQueue::new(8, OverflowPolicy::DropOldest);
        for i in 0..1000u32 {
            queue.push(i);
            if i % 3 == 0 {
                queue.try_pop();
            }
            if i % 97 == 0 {
                queue.clear();
            }
            assert!(queue.len() <= 8);
        }
    }

    #[test]
    fn test_backpressure_rejects_when_full() {
        let queue = FrameQueue::new(2, OverflowPolicy::Backpressure);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.push(3), PushOutcome::Rejected(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_clear_and_retain() {
        let queue = FrameQueue::new(10, OverflowPolicy::DropOldest);
        for i in 0..6 {
            queue.push(i);
        }

        assert_eq!(queue.retain(|&i| i >= 4), 4);
        assert_eq!(queue.try_pop(), Some(4));

        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_minimum_capacity() {
        let queue: FrameQueue<u8> = FrameQueue::new(0, OverflowPolicy::DropOldest);
        assert_eq!(queue.capacity(), 1);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(FrameQueue::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(42);

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Some(42));
    }

    #[tokio::test]
    async fn test_close_ends_pop() {
        let queue: Arc<FrameQueue<u8>> = Arc::new(FrameQueue::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, None);
        assert_eq!(queue.push(1), PushOutcome::Rejected(1));
    }

    #[tokio::test]
    async fn test_push_wait_resumes_after_pop() {
        let queue = Arc::new(FrameQueue::new(1, OverflowPolicy::Backpressure));
        queue.push(1);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push_wait(2).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop(), Some(1));

        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(queue.try_pop(), Some(2));
    }

    #[tokio::test]
    async fn test_push_wait_fails_when_closed() {
        let queue = Arc::new(FrameQueue::new(1, OverflowPolicy::Backpressure));
        queue.push(1);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push_wait(2).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(2));
    }
}
