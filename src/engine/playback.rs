//! Playback of synthesized audio
//!
//! The receive side enqueues decoded chunks (any length) into a backpressure
//! queue. A dedicated blocking thread re-chunks them to the device write size
//! and writes continuously, filling gaps with silence so the device never
//! stalls. Enqueued audio is only ever dropped by [`PlaybackHandle::flush`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::audio::{FrameQueue, OutputDevice, OverflowPolicy};
use crate::error::EngineError;
use crate::metrics::{Counter, EngineMetrics};
use crate::state_machine::{Event, SessionSnapshot, SessionState};

/// How often `wait_idle` re-checks the buffer
const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct PlaybackShared {
    queue: FrameQueue<Vec<i16>>,
    /// Bumped by every flush; the playback thread drops its partial chunk when it changes
    epoch: AtomicU64,
    /// Playback thread holds samples not yet written
    busy: AtomicBool,
}

/// Cloneable handle to the playback buffer
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    shared: Arc<PlaybackShared>,
}

impl PlaybackHandle {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PlaybackShared {
                queue: FrameQueue::new(capacity, OverflowPolicy::Backpressure),
                epoch: AtomicU64::new(0),
                busy: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a chunk, waiting for space. Fails only once playback is shut down.
    pub async fn enqueue(&self, pcm: Vec<i16>) -> Result<(), Vec<i16>> {
        self.shared.queue.push_wait(pcm).await
    }

    /// Discard everything buffered, including a partially written chunk.
    ///
    /// Returns the number of queued chunks dropped.
    pub fn flush(&self) -> usize {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let dropped = self.shared.queue.clear();
        self.shared.busy.store(false, Ordering::SeqCst);
        dropped
    }

    /// Nothing queued and nothing pending on the playback thread
    pub fn is_idle(&self) -> bool {
        !self.shared.busy.load(Ordering::SeqCst) && self.shared.queue.is_empty()
    }

    /// Wait until everything enqueued so far has been written
    pub async fn wait_idle(&self) {
        while !self.is_idle() {
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    /// Chunks currently queued
    pub fn buffered(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop accepting audio and wake any waiting producer
    pub fn close(&self) {
        self.shared.queue.close();
    }

    fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    /// Pop everything queued, returning the total sample count
    #[cfg(test)]
    pub(crate) fn take_queued_samples(&self) -> usize {
        let mut samples = 0;
        while let Some(chunk) = self.shared.queue.try_pop() {
            samples += chunk.len();
        }
        samples
    }
}

/// Blocking playback loop; owns the output device
pub(crate) struct PlaybackTask<O: OutputDevice> {
    pub device: O,
    pub handle: PlaybackHandle,
    pub chunk_samples: usize,
    pub state: watch::Receiver<SessionSnapshot>,
    pub events: mpsc::Sender<Event>,
    pub metrics: Arc<EngineMetrics>,
    pub cancel: CancellationToken,
}

impl<O: OutputDevice> PlaybackTask<O> {
    pub fn run(mut self) {
        let shared = self.handle.shared.clone();
        let chunk_samples = self.chunk_samples.max(1);
        let silence = vec![0i16; chunk_samples];
        let mut pending: VecDeque<i16> = VecDeque::new();
        let mut seen_epoch = self.handle.epoch();
        let mut chunk: Vec<i16> = Vec::with_capacity(chunk_samples);
        let mut written: u64 = 0;

        log::info!("Playback: started ({} samples per write)", chunk_samples);

        while !self.cancel.is_cancelled() {
            let epoch = self.handle.epoch();
            if epoch != seen_epoch {
                log::debug!(
                    "Playback: flush observed, dropping {} pending samples",
                    pending.len()
                );
                pending.clear();
                self.device.discard();
                seen_epoch = epoch;
            }

            while pending.len() < chunk_samples {
                if !shared.queue.is_empty() {
                    shared.busy.store(true, Ordering::SeqCst);
                }
                match shared.queue.try_pop() {
                    Some(samples) => pending.extend(samples),
                    None => break,
                }
            }

            let result = if pending.is_empty() {
                shared.busy.store(false, Ordering::SeqCst);
                if self.state.borrow().state == SessionState::BotSpeaking {
                    self.metrics.incr(Counter::PlaybackUnderruns);
                }
                self.device.write_chunk(&silence)
            } else {
                chunk.clear();
                let take = pending.len().min(chunk_samples);
                chunk.extend(pending.drain(..take));

                // A flush between pop and write must not reach the device
                if self.handle.epoch() != seen_epoch {
                    continue;
                }
                let result = self.device.write_chunk(&chunk);
                written += 1;
                if written % 50 == 0 {
                    log::debug!(
                        "Playback: {} chunks written, {} queued",
                        written,
                        shared.queue.len()
                    );
                }
                if pending.is_empty() && shared.queue.is_empty() {
                    shared.busy.store(false, Ordering::SeqCst);
                }
                result
            };

            if let Err(e) = result {
                log::error!("Playback: output device failed: {}", e);
                let _ = self.events.blocking_send(Event::Fatal {
                    error: EngineError::Device(e),
                });
                break;
            }
        }

        shared.busy.store(false, Ordering::SeqCst);
        log::info!("Playback: stopped after {} chunks", written);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MockOutput;

    #[tokio::test]
    async fn test_idle_tracking() {
        let handle = PlaybackHandle::new(4);
        assert!(handle.is_idle());

        handle.enqueue(vec![1, 2, 3]).await.unwrap();
        assert!(!handle.is_idle());
        assert_eq!(handle.buffered(), 1);

        assert_eq!(handle.flush(), 1);
        assert!(handle.is_idle());
    }

    #[tokio::test]
    async fn test_close_rejects_enqueue() {
        let handle = PlaybackHandle::new(1);
        handle.close();
        assert_eq!(handle.enqueue(vec![1]).await, Err(vec![1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_plays_in_order_and_rechunks() {
        let (output, control) = MockOutput::new(24000);
        let handle = PlaybackHandle::new(16);
        let (_state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        let (events_tx, _events_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = PlaybackTask {
            device: output,
            handle: handle.clone(),
            chunk_samples: 4,
            state: state_rx,
            events: events_tx,
            metrics: Arc::new(EngineMetrics::new()),
            cancel: cancel.clone(),
        };
        let thread = tokio::task::spawn_blocking(move || task.run());

        // Chunk sizes unrelated to the write size
        handle.enqueue(vec![1, 2, 3]).await.unwrap();
        handle.enqueue(vec![4, 5, 6, 7, 8]).await.unwrap();
        handle.enqueue(vec![9]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle.wait_idle())
            .await
            .unwrap();
        cancel.cancel();
        thread.await.unwrap();

        assert_eq!(control.written(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_device_failure_is_fatal() {
        let (output, control) = MockOutput::new(24000);
        control.fail("speaker gone");
        let handle = PlaybackHandle::new(4);
        let (_state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        let (events_tx, mut events_rx) = mpsc::channel(4);

        let task = PlaybackTask {
            device: output,
            handle,
            chunk_samples: 4,
            state: state_rx,
            events: events_tx,
            metrics: Arc::new(EngineMetrics::new()),
            cancel: CancellationToken::new(),
        };
        tokio::task::spawn_blocking(move || task.run()).await.unwrap();

        assert!(matches!(
            events_rx.recv().await,
            Some(Event::Fatal {
                error: EngineError::Device(_)
            })
        ));
    }
}
