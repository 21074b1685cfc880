//! Microphone capture loop
//!
//! Runs on a blocking thread for the whole session. Reads fixed-size chunks
//! from the input device, stamps each with the next sequence number and
//! publishes it to the fan-out. Publishing never blocks, so a slow consumer
//! cannot stall the device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioFrame, FanOut, InputDevice};
use crate::error::EngineError;
use crate::metrics::{Counter, EngineMetrics};
use crate::state_machine::Event;

pub(crate) struct CaptureTask<I: InputDevice> {
    pub device: I,
    pub frame_samples: usize,
    pub fanout: Arc<FanOut>,
    /// Next sequence number to assign; read by the controller as a flush cutoff
    pub next_sequence: Arc<AtomicU64>,
    pub events: mpsc::Sender<Event>,
    pub metrics: Arc<EngineMetrics>,
    pub cancel: CancellationToken,
}

impl<I: InputDevice> CaptureTask<I> {
    pub fn run(mut self) {
        let sample_rate = self.device.sample_rate();
        let mut buf = vec![0i16; self.frame_samples.max(1)];
        let mut captured: u64 = 0;
        let mut evicted: u64 = 0;
        let mut overruns: u64 = self.device.overruns();

        log::info!(
            "Capture: started ({} samples per frame at {}Hz)",
            buf.len(),
            sample_rate
        );

        while !self.cancel.is_cancelled() {
            if let Err(e) = self.device.read_chunk(&mut buf) {
                if self.cancel.is_cancelled() {
                    break;
                }
                log::error!("Capture: input device failed: {}", e);
                let _ = self.events.blocking_send(Event::Fatal {
                    error: EngineError::Device(e),
                });
                break;
            }

            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            let frame = AudioFrame::new(buf.clone(), sample_rate, sequence).shared();
            let delivery = self.fanout.publish(frame);

            captured += 1;
            evicted += delivery.evicted as u64;
            self.metrics.incr(Counter::FramesCaptured);

            let device_overruns = self.device.overruns();
            if device_overruns > overruns {
                self.metrics
                    .add(Counter::InputOverruns, device_overruns - overruns);
                overruns = device_overruns;
            }

            if captured % 50 == 0 {
                log::debug!(
                    "Capture: {} frames captured, {} evictions so far",
                    captured,
                    evicted
                );
            }
        }

        log::info!("Capture: stopped after {} frames", captured);
    }
}
