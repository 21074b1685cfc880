//! Streaming of captured frames to the remote connection
//!
//! One `TransmitTask` per pipeline generation. It drains the transmit branch
//! of the fan-out in sequence order, sends frames while the session is
//! listening, and commits the user's turn on trailing silence.
//!
//! ```text
//! FrameQueue (transmit) ──▶ TransmitTask ──▶ FrameSink ──▶ remote
//!                               │
//!                               └─ TurnDetector ──▶ commit + QuerySent
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::monitor::rms;
use crate::audio::{AudioFrame, FrameSubscriber};
use crate::error::ConnectionError;
use crate::metrics::{Counter, EngineMetrics};
use crate::remote::FrameSink;
use crate::settings::TurnConfig;
use crate::state_machine::{Event, SessionSnapshot, SessionState};

/// Detects the end of a user turn from frame energy
#[derive(Debug, Clone)]
pub struct TurnDetector {
    silence_threshold: f32,
    silence_duration_us: u64,
    max_utterance_us: u64,
    in_speech: bool,
    /// Accumulated in microseconds so frames that are not a whole number of
    /// milliseconds do not drift
    speech_us: u64,
    silence_us: u64,
}

impl TurnDetector {
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            silence_threshold: config.silence_threshold,
            silence_duration_us: config.silence_duration_ms.saturating_mul(1000),
            max_utterance_us: config.max_utterance_ms.saturating_mul(1000),
            in_speech: false,
            speech_us: 0,
            silence_us: 0,
        }
    }

    /// Feed one frame; returns `true` when the turn should be committed
    pub fn observe(&mut self, frame: &AudioFrame) -> bool {
        let duration = frame.duration_us();
        let loud = rms(frame.samples()) > self.silence_threshold;

        if !self.in_speech {
            if loud {
                self.in_speech = true;
                self.speech_us = duration;
                self.silence_us = 0;
            }
            return false;
        }

        self.speech_us += duration;
        if loud {
            self.silence_us = 0;
        } else {
            self.silence_us += duration;
        }

        self.silence_us >= self.silence_duration_us || self.speech_us >= self.max_utterance_us
    }

    pub fn reset(&mut self) {
        self.in_speech = false;
        self.speech_us = 0;
        self.silence_us = 0;
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }
}

pub(crate) struct TransmitTask {
    pub generation: u64,
    pub queue: FrameSubscriber,
    pub sink: Box<dyn FrameSink>,
    /// Frames captured before this generation's flush cutoff are never sent
    pub min_sequence: u64,
    pub turn: TurnDetector,
    pub state: watch::Receiver<SessionSnapshot>,
    pub events: mpsc::Sender<Event>,
    pub metrics: Arc<EngineMetrics>,
    pub cancel: CancellationToken,
}

impl TransmitTask {
    /// Run until cancelled or the connection fails. Returns the sink so the
    /// controller can close it.
    pub async fn run(mut self) -> Box<dyn FrameSink> {
        let mut sent: u64 = 0;

        log::info!(
            "Transmit: generation {} started (frames from {})",
            self.generation,
            self.min_sequence
        );

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = self.queue.pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            if frame.sequence() < self.min_sequence {
                log::trace!("Transmit: skipping stale frame {}", frame.sequence());
                continue;
            }

            let snapshot = *self.state.borrow();
            if snapshot.generation != self.generation {
                // Superseded; leave the rest of the queue to the next generation
                log::debug!("Transmit: generation {} superseded", self.generation);
                break;
            }
            if snapshot.state != SessionState::Listening {
                self.turn.reset();
                continue;
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.sink.send_frame(&frame) => result,
            };
            if let Err(e) = result {
                self.connection_lost(e).await;
                break;
            }

            sent += 1;
            self.metrics.incr(Counter::FramesTransmitted);
            if sent % 50 == 0 {
                log::debug!(
                    "Transmit: {} frames sent, {} queued",
                    sent,
                    self.queue.len()
                );
            }

            if self.turn.observe(&frame) {
                self.turn.reset();
                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    result = self.sink.commit() => result,
                };
                if let Err(e) = result {
                    self.connection_lost(e).await;
                    break;
                }

                log::info!("Transmit: end of turn at frame {}, query sent", frame.sequence());
                self.metrics.incr(Counter::QueriesCommitted);
                self.emit(Event::QuerySent {
                    generation: self.generation,
                })
                .await;
            }
        }

        log::info!(
            "Transmit: generation {} stopped after {} frames",
            self.generation,
            sent
        );
        self.sink
    }

    async fn connection_lost(&mut self, error: ConnectionError) {
        if self.cancel.is_cancelled() {
            return;
        }
        log::warn!("Transmit: connection lost: {}", error);
        self.emit(Event::ConnectionLost {
            generation: self.generation,
            error,
        })
        .await;
    }

    /// Report to the controller unless this generation is being torn down
    async fn emit(&mut self, event: Event) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            result = self.events.send(event) => {
                if result.is_err() {
                    log::debug!("Transmit: controller gone");
                }
            }
        }
    }
}
