//! Receipt of synthesized audio from the remote connection
//!
//! Chunks arrive at whatever size the service chooses. Each is converted to
//! the output rate and handed to playback with backpressure; nothing is
//! dropped here. The end-of-response marker is forwarded only once playback
//! has drained, so the monitor keeps listening through the audible tail.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::playback::PlaybackHandle;
use crate::audio::RateConverter;
use crate::error::ConnectionError;
use crate::metrics::{Counter, EngineMetrics};
use crate::remote::InboundEvent;
use crate::state_machine::{Event, SessionSnapshot, SessionState};

pub(crate) struct ReceiveTask {
    pub generation: u64,
    pub inbound: mpsc::Receiver<InboundEvent>,
    pub playback: PlaybackHandle,
    pub output_sample_rate: u32,
    pub state: watch::Receiver<SessionSnapshot>,
    pub events: mpsc::Sender<Event>,
    pub metrics: Arc<EngineMetrics>,
    pub cancel: CancellationToken,
}

impl ReceiveTask {
    pub async fn run(mut self) {
        let mut received: u64 = 0;
        // Chunks of one response share a converter so no samples are lost at chunk edges
        let mut converter: Option<RateConverter> = None;

        log::info!("Receive: generation {} started", self.generation);

        loop {
            let inbound = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                inbound = self.inbound.recv() => inbound,
            };

            let Some(inbound) = inbound else {
                if !self.cancel.is_cancelled() {
                    log::warn!("Receive: remote stream ended");
                    self.emit(Event::ConnectionLost {
                        generation: self.generation,
                        error: ConnectionError::Disconnected("Inbound stream ended".to_string()),
                    })
                    .await;
                }
                break;
            };

            match inbound {
                InboundEvent::Audio { pcm, sample_rate } => {
                    let pcm = match self.convert(&mut converter, &pcm, sample_rate) {
                        Some(pcm) => pcm,
                        None => continue,
                    };
                    received += 1;
                    self.metrics.incr(Counter::ChunksReceived);
                    if received % 50 == 0 {
                        log::debug!(
                            "Receive: {} chunks received, {} buffered for playback",
                            received,
                            self.playback.buffered()
                        );
                    }

                    if pcm.is_empty() {
                        continue;
                    }

                    let enqueued = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        enqueued = self.playback.enqueue(pcm) => enqueued,
                    };
                    if enqueued.is_err() {
                        log::debug!("Receive: playback closed");
                        break;
                    }

                    if self.state.borrow().state != SessionState::BotSpeaking {
                        self.emit(Event::ResponseAudio {
                            generation: self.generation,
                        })
                        .await;
                    }
                }
                InboundEvent::EndOfResponse => {
                    let tail = match converter.take().map(|mut c| c.finish()) {
                        Some(Ok(tail)) => tail,
                        Some(Err(e)) => {
                            log::warn!("Receive: dropping response tail: {}", e);
                            Vec::new()
                        }
                        None => Vec::new(),
                    };
                    if !tail.is_empty() {
                        let enqueued = tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => break,
                            enqueued = self.playback.enqueue(tail) => enqueued,
                        };
                        if enqueued.is_err() {
                            log::debug!("Receive: playback closed");
                            break;
                        }
                    }

                    log::debug!("Receive: end of response, waiting for playback to drain");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.playback.wait_idle() => {}
                    }
                    log::info!("Receive: response finished ({} chunks)", received);
                    self.emit(Event::ResponseEnded {
                        generation: self.generation,
                    })
                    .await;
                }
                InboundEvent::Transcript(text) => log::info!("Receive: user said: {}", text),
                InboundEvent::ResponseText(text) => log::debug!("Receive: response text: {}", text),
                InboundEvent::Error(message) => log::warn!("Receive: service error: {}", message),
            }
        }

        log::info!(
            "Receive: generation {} stopped after {} chunks",
            self.generation,
            received
        );
    }

    /// Convert a chunk to the output rate, reusing the converter while the source rate holds
    fn convert(
        &self,
        converter: &mut Option<RateConverter>,
        pcm: &[i16],
        sample_rate: u32,
    ) -> Option<Vec<i16>> {
        if converter.as_ref().map(|c| c.source_rate()) != Some(sample_rate) {
            match RateConverter::new(sample_rate, self.output_sample_rate) {
                Ok(fresh) => *converter = Some(fresh),
                Err(e) => {
                    log::warn!("Receive: dropping audio chunk: {}", e);
                    return None;
                }
            }
        }

        let active = converter.as_mut()?;
        match active.process(pcm) {
            Ok(pcm) => Some(pcm),
            Err(e) => {
                log::warn!("Receive: dropping audio chunk: {}", e);
                active.reset();
                None
            }
        }
    }

    async fn emit(&mut self, event: Event) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            result = self.events.send(event) => {
                if result.is_err() {
                    log::debug!("Receive: controller gone");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Harness {
        inbound: mpsc::Sender<InboundEvent>,
        events: mpsc::Receiver<Event>,
        playback: PlaybackHandle,
        cancel: CancellationToken,
        _state: watch::Sender<SessionSnapshot>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn(state: SessionState) -> Harness {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(SessionSnapshot {
            state,
            generation: 1,
            turn: 0,
        });
        let playback = PlaybackHandle::new(8);
        let cancel = CancellationToken::new();

        let task = ReceiveTask {
            generation: 1,
            inbound: inbound_rx,
            playback: playback.clone(),
            output_sample_rate: 24000,
            state: state_rx,
            events: events_tx,
            metrics: Arc::new(EngineMetrics::new()),
            cancel: cancel.clone(),
        };

        Harness {
            inbound: inbound_tx,
            events: events_rx,
            playback,
            cancel,
            _state: state_tx,
            task: tokio::spawn(task.run()),
        }
    }

    #[tokio::test]
    async fn test_audio_is_enqueued_and_announced() {
        let mut h = spawn(SessionState::AwaitingResponse);

        h.inbound
            .send(InboundEvent::Audio {
                pcm: vec![1, 2, 3],
                sample_rate: 24000,
            })
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(Event::ResponseAudio { generation: 1 })));
        assert_eq!(h.playback.buffered(), 1);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resamples_to_output_rate() {
        let h = spawn(SessionState::BotSpeaking);

        // One second at 22.05kHz, not a whole multiple of the output rate
        for _ in 0..5 {
            h.inbound
                .send(InboundEvent::Audio {
                    pcm: vec![800; 4410],
                    sample_rate: 22050,
                })
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.cancel.cancel();
        h.task.await.unwrap();
        let samples = h.playback.take_queued_samples();
        assert!(
            (23_500..=24_000).contains(&samples),
            "got {} samples for one second",
            samples
        );
    }

    #[tokio::test]
    async fn test_end_of_response_flushes_resampler_tail() {
        let mut h = spawn(SessionState::BotSpeaking);

        // Less than one resampler block: nothing can be played yet
        h.inbound
            .send(InboundEvent::Audio {
                pcm: vec![800; 100],
                sample_rate: 16000,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.playback.buffered(), 0);

        h.inbound.send(InboundEvent::EndOfResponse).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.playback.take_queued_samples(), 150);

        let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(Event::ResponseEnded { generation: 1 })));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_end_of_response_waits_for_drain() {
        let mut h = spawn(SessionState::BotSpeaking);

        h.inbound
            .send(InboundEvent::Audio {
                pcm: vec![1; 10],
                sample_rate: 24000,
            })
            .await
            .unwrap();
        h.inbound.send(InboundEvent::EndOfResponse).await.unwrap();

        // Nothing is playing the buffer, so ResponseEnded must not arrive yet
        let early = tokio::time::timeout(Duration::from_millis(50), h.events.recv()).await;
        assert!(early.is_err());

        h.playback.flush();
        let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(Event::ResponseEnded { generation: 1 })));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_reports_connection_lost() {
        let mut h = spawn(SessionState::Listening);
        drop(h.inbound);

        let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(Event::ConnectionLost { generation: 1, .. })
        ));
        h.task.await.unwrap();
    }
}
