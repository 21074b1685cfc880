//! Fan-out of captured frames to independent bounded consumers
//!
//! One producer, N subscriber queues. Each subscriber has its own capacity and
//! drop-oldest policy, so a slow consumer only loses its own oldest frames and
//! never stalls or reorders delivery to the others.
//!
//! ```text
//!                       ┌──▶ FrameQueue (transmit) ──▶ TransmitTask
//! CaptureTask ──▶ FanOut┤
//!                       └──▶ FrameQueue (monitor)  ──▶ InterruptionMonitor
//! ```

use std::sync::Arc;

use super::frame::SharedFrame;
use super::queue::{FrameQueue, OverflowPolicy, PushOutcome};

/// Queue of shared frames handed out by [`FanOut::subscribe`]
pub type FrameSubscriber = Arc<FrameQueue<SharedFrame>>;

/// Per-publish delivery summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Subscribers that accepted the frame
    pub delivered: usize,
    /// Subscribers that had to evict their oldest frame
    pub evicted: usize,
}

/// Duplicates each published frame (by reference) into every subscriber queue
#[derive(Debug, Default)]
pub struct FanOut {
    subscribers: Vec<FrameSubscriber>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new drop-oldest subscriber queue
    pub fn subscribe(&mut self, capacity: usize) -> FrameSubscriber {
        let queue = Arc::new(FrameQueue::new(capacity, OverflowPolicy::DropOldest));
        self.subscribers.push(queue.clone());
        queue
    }

    /// Deliver one frame to every subscriber.
    ///
    /// Never blocks: a full subscriber evicts its oldest frame.
    pub fn publish(&self, frame: SharedFrame) -> Delivery {
        let mut delivery = Delivery::default();
        for queue in &self.subscribers {
            match queue.push(frame.clone()) {
                PushOutcome::Accepted => delivery.delivered += 1,
                PushOutcome::Evicted(old) => {
                    log::trace!(
                        "FanOut: evicted frame {} to admit {}",
                        old.sequence(),
                        frame.sequence()
                    );
                    delivery.delivered += 1;
                    delivery.evicted += 1;
                }
                PushOutcome::Rejected(_) => {}
            }
        }
        delivery
    }

    /// Drop frames captured before `sequence` from every subscriber
    pub fn discard_before(&self, sequence: u64) -> usize {
        self.subscribers
            .iter()
            .map(|queue| queue.retain(|frame| frame.sequence() >= sequence))
            .sum()
    }

    /// Close every subscriber queue
    pub fn close(&self) {
        for queue in &self.subscribers {
            queue.close();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::AudioFrame;

    fn frame(seq: u64) -> SharedFrame {
        AudioFrame::new(vec![seq as i16; 4], 16000, seq).shared()
    }

    #[test]
    fn test_each_subscriber_gets_same_frame() {
        let mut fanout = FanOut::new();
        let a = fanout.subscribe(4);
        let b = fanout.subscribe(4);

        let delivery = fanout.publish(frame(0));
        assert_eq!(delivery.delivered, 2);

        let fa = a.try_pop().unwrap();
        let fb = b.try_pop().unwrap();
        // Shared by reference, not copied
        assert!(Arc::ptr_eq(&fa, &fb));
    }

    #[test]
    fn test_slow_subscriber_does_not_affect_fast_one() {
        let mut fanout = FanOut::new();
        let slow = fanout.subscribe(3);
        let fast = fanout.subscribe(3);

        let mut fast_seen = Vec::new();
        for seq in 0..10 {
            fanout.publish(frame(seq));
            // Fast consumer drains every frame, slow one never drains
            while let Some(f) = fast.try_pop() {
                fast_seen.push(f.sequence());
            }
        }

        assert_eq!(fast_seen, (0..10).collect::<Vec<_>>());
        assert_eq!(fast.dropped(), 0);

        // Slow branch kept only the most recent frames, still in order
        let slow_seen: Vec<_> = std::iter::from_fn(|| slow.try_pop())
            .map(|f| f.sequence())
            .collect();
        assert_eq!(slow_seen, vec![7, 8, 9]);
        assert_eq!(slow.dropped(), 7);
    }

    #[test]
    fn test_discard_before() {
        let mut fanout = FanOut::new();
        let a = fanout.subscribe(10);
        let b = fanout.subscribe(10);
        for seq in 0..5 {
            fanout.publish(frame(seq));
        }

        // 3 stale frames in each of the two queues
        assert_eq!(fanout.discard_before(3), 6);
        assert_eq!(a.try_pop().unwrap().sequence(), 3);
        assert_eq!(b.len(), 2);
    }
}
