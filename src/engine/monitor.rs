//! Barge-in detection
//!
//! Scores each captured frame while the bot is speaking. Three independent
//! heuristics are OR-combined: loudness (RMS), onset (RMS rise over the
//! previous frame), and voicing (zero-crossing rate). Any one is enough.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::audio::FrameSubscriber;
use crate::metrics::{Counter, EngineMetrics};
use crate::settings::InterruptionConfig;
use crate::state_machine::{Event, SessionSnapshot, SessionState};

/// Full-scale PCM16 amplitude used to normalize RMS to 0.0-1.0
const FULL_SCALE: f32 = 32768.0;

/// Per-frame barge-in score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterruptionSignal {
    /// Normalized RMS energy
    pub rms: f32,
    /// `rms` minus the previous frame's `rms`
    pub energy_delta: f32,
    /// Sign changes per sample
    pub zcr: f32,
    pub interrupt: bool,
}

/// Normalized root-mean-square energy
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / FULL_SCALE as f64;
            v * v
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Fraction of adjacent sample pairs with strictly opposite signs.
///
/// Zero samples carry no sign, so digital silence has a rate of 0.
pub fn zero_crossing_rate(samples: &[i16]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] > 0 && pair[1] < 0) || (pair[0] < 0 && pair[1] > 0))
        .count();
    crossings as f32 / samples.len() as f32
}

/// Score one frame against the thresholds.
///
/// `prev_rms` is `None` for the first frame of a turn, which then has no delta.
pub fn evaluate(
    samples: &[i16],
    prev_rms: Option<f32>,
    thresholds: &InterruptionConfig,
) -> InterruptionSignal {
    let rms = rms(samples);
    let energy_delta = prev_rms.map(|prev| rms - prev).unwrap_or(0.0);
    let zcr = zero_crossing_rate(samples);

    let interrupt = rms > thresholds.rms_threshold
        || energy_delta > thresholds.spike_threshold
        || zcr > thresholds.voice_threshold;

    InterruptionSignal {
        rms,
        energy_delta,
        zcr,
        interrupt,
    }
}

/// Single-flight entry point into the controller's flush.
///
/// The first `fire` wins and sends one `Interrupt` event; every other call
/// is rejected until the controller releases the guard.
#[derive(Debug, Clone)]
pub struct FlushTrigger {
    in_flight: Arc<AtomicBool>,
    events: mpsc::Sender<Event>,
    metrics: Arc<EngineMetrics>,
}

impl FlushTrigger {
    pub(crate) fn new(events: mpsc::Sender<Event>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            in_flight: Arc::new(AtomicBool::new(false)),
            events,
            metrics,
        }
    }

    /// Request a flush. Returns `true` if this call was the one that got through.
    pub fn fire(&self, generation: u64, signal: InterruptionSignal) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.metrics.incr(Counter::DuplicateTriggers);
            log::debug!("FlushTrigger: flush already in flight, ignoring trigger");
            return false;
        }

        if let Err(e) = self.events.try_send(Event::Interrupt { generation, signal }) {
            log::warn!("FlushTrigger: could not reach controller: {}", e);
            self.release();
            return false;
        }
        true
    }

    /// Re-arm the trigger. Called by the controller once no flush is running.
    pub(crate) fn release(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Drains the monitor branch of the fan-out
pub(crate) struct InterruptionMonitor {
    pub queue: FrameSubscriber,
    pub state: watch::Receiver<SessionSnapshot>,
    pub trigger: FlushTrigger,
    pub thresholds: InterruptionConfig,
    pub metrics: Arc<EngineMetrics>,
    pub cancel: CancellationToken,
}

impl InterruptionMonitor {
    pub async fn run(self) {
        let mut prev_rms: Option<f32> = None;
        // Turn in which we already fired; stay quiet until the next one
        let mut fired_turn: Option<u64> = None;
        let mut evaluated: u64 = 0;

        log::info!("Monitor: started");

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = self.queue.pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let snapshot = *self.state.borrow();
            if snapshot.state != SessionState::BotSpeaking {
                prev_rms = None;
                continue;
            }
            if fired_turn == Some(snapshot.turn) {
                continue;
            }

            let signal = evaluate(frame.samples(), prev_rms, &self.thresholds);
            prev_rms = Some(signal.rms);
            evaluated += 1;

            log::trace!(
                "Monitor: frame {} rms={:.4} delta={:.4} zcr={:.3}",
                frame.sequence(),
                signal.rms,
                signal.energy_delta,
                signal.zcr
            );
            if evaluated % 50 == 0 {
                log::debug!("Monitor: {} frames evaluated", evaluated);
            }

            if signal.interrupt {
                log::info!(
                    "Monitor: barge-in at frame {} (rms={:.4}, energy_delta={:.4}, zcr={:.3})",
                    frame.sequence(),
                    signal.rms,
                    signal.energy_delta,
                    signal.zcr
                );
                self.metrics.incr(Counter::InterruptsDetected);
                self.trigger.fire(snapshot.generation, signal);
                fired_turn = Some(snapshot.turn);
                prev_rms = None;
            }
        }

        log::info!("Monitor: stopped after {} frames evaluated", evaluated);
    }
}
