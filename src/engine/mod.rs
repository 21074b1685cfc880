//! Real-time duplex audio engine
//!
//! # Architecture
//!
//! ```text
//!                               ┌──▶ transmit queue ──▶ TransmitTask ──▶ remote
//! input ──▶ CaptureTask ──▶ FanOut
//!                               └──▶ monitor queue ──▶ InterruptionMonitor
//!                                                          │ FlushTrigger
//!                                                          ▼
//!            every task ──── Event ────────────▶ FlushController ──▶ watch<SessionSnapshot>
//!
//! remote ──▶ ReceiveTask ──▶ PlaybackHandle ──▶ PlaybackTask ──▶ output
//! ```
//!
//! Capture and playback own their devices on blocking threads for the whole
//! session. Transmit and receive are re-spawned for every pipeline
//! generation, that is, once per remote connection.
//!
//! # Usage
//!
//! ```no_run
//! # async fn demo() -> Result<(), duplex_voice::EngineError> {
//! use std::sync::Arc;
//! use duplex_voice::audio::{MockInput, MockOutput};
//! use duplex_voice::remote::MockConnector;
//! use duplex_voice::{EngineConfig, SessionHandle};
//!
//! let (input, _mic) = MockInput::new(16000);
//! let (output, _speaker) = MockOutput::new(24000);
//! let (connector, _remote) = MockConnector::new();
//!
//! let mut session = SessionHandle::new(EngineConfig::default())?;
//! session.start(input, output, Arc::new(connector))?;
//! // ...
//! let report = session.stop().await?;
//! println!("{} flushes", report.metrics.flushes);
//! # Ok(())
//! # }
//! ```

mod capture;
mod controller;
mod monitor;
mod playback;
mod receive;
mod transmit;

pub use monitor::{evaluate, rms, zero_crossing_rate, FlushTrigger, InterruptionSignal};
pub use playback::PlaybackHandle;
pub use transmit::TurnDetector;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{FanOut, FrameSubscriber, InputDevice, OutputDevice};
use crate::error::EngineError;
use crate::metrics::{EngineMetrics, MetricsSnapshot, SessionReport};
use crate::remote::{RetryPolicy, SpeechConnector};
use crate::settings::EngineConfig;
use crate::state_machine::{Event, SessionSnapshot, SessionState};

use capture::CaptureTask;
use controller::Controller;
use monitor::InterruptionMonitor;
use playback::PlaybackTask;

/// Controller inbox size
const EVENT_CAPACITY: usize = 256;

/// How long the supervisor waits for a device thread after shutdown
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

struct Running {
    events: mpsc::Sender<Event>,
    trigger: FlushTrigger,
    stop: CancellationToken,
    transmit_queue: FrameSubscriber,
    monitor_queue: FrameSubscriber,
    supervisor: JoinHandle<SessionReport>,
}

/// Owner-side handle to one duplex session.
///
/// The rest of the application only ever starts, stops and observes the
/// session through this type; queues and state stay internal to the engine.
pub struct SessionHandle {
    id: Uuid,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
    state_rx: watch::Receiver<SessionSnapshot>,
    /// Taken by `start`
    state_tx: Option<watch::Sender<SessionSnapshot>>,
    running: Option<Running>,
}

impl SessionHandle {
    /// Create an idle session. Fails if the configuration is unusable.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            metrics: Arc::new(EngineMetrics::new()),
            state_rx,
            state_tx: Some(state_tx),
            running: None,
        })
    }

    /// Spawn every engine task and move the session to `Listening`.
    ///
    /// Must be called from within a tokio runtime. A session can be started
    /// only once.
    pub fn start<I, O>(
        &mut self,
        input: I,
        output: O,
        connector: Arc<dyn SpeechConnector>,
    ) -> Result<(), EngineError>
    where
        I: InputDevice,
        O: OutputDevice,
    {
        let state_tx = self.state_tx.take().ok_or(EngineError::AlreadyStarted)?;
        let audio = &self.config.audio;
        let queues = &self.config.queues;

        if input.sample_rate() != audio.input_sample_rate {
            log::warn!(
                "Session: input device runs at {}Hz, configured {}Hz",
                input.sample_rate(),
                audio.input_sample_rate
            );
        }
        let output_sample_rate = output.sample_rate();

        log::info!(
            "Session {}: starting (in {}Hz x {} samples, out {}Hz)",
            self.id,
            input.sample_rate(),
            audio.frame_samples,
            output_sample_rate
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let session = CancellationToken::new();
        let stop = CancellationToken::new();

        let mut fanout = FanOut::new();
        let transmit_queue = fanout.subscribe(queues.transmit_capacity);
        let monitor_queue = fanout.subscribe(queues.monitor_capacity);
        let fanout = Arc::new(fanout);

        let playback = PlaybackHandle::new(queues.playback_capacity);
        let next_sequence = Arc::new(AtomicU64::new(0));
        let trigger = FlushTrigger::new(events_tx.clone(), self.metrics.clone());

        let capture = CaptureTask {
            device: input,
            frame_samples: audio.frame_samples,
            fanout: fanout.clone(),
            next_sequence: next_sequence.clone(),
            events: events_tx.clone(),
            metrics: self.metrics.clone(),
            cancel: session.child_token(),
        };
        let capture = tokio::task::spawn_blocking(move || capture.run());

        let player = PlaybackTask {
            device: output,
            handle: playback.clone(),
            chunk_samples: audio.output_chunk_samples,
            state: state_tx.subscribe(),
            events: events_tx.clone(),
            metrics: self.metrics.clone(),
            cancel: session.child_token(),
        };
        let player = tokio::task::spawn_blocking(move || player.run());

        let monitor = InterruptionMonitor {
            queue: monitor_queue.clone(),
            state: state_tx.subscribe(),
            trigger: trigger.clone(),
            thresholds: self.config.interruption,
            metrics: self.metrics.clone(),
            cancel: session.child_token(),
        };
        let monitor = tokio::spawn(monitor.run());

        let snapshot = *state_tx.borrow();
        let controller = Controller {
            snapshot,
            state_tx,
            events_rx,
            events_tx: events_tx.clone(),
            fanout,
            transmit_queue: transmit_queue.clone(),
            playback,
            next_sequence,
            trigger: trigger.clone(),
            metrics: self.metrics.clone(),
            connector,
            retry: RetryPolicy::from(&self.config.retry),
            turn: self.config.turn.clone(),
            output_sample_rate,
            stop: stop.clone(),
            session,
        };

        let id = self.id;
        let metrics = self.metrics.clone();
        let queues = (transmit_queue.clone(), monitor_queue.clone());
        let started_at = Utc::now();
        let started = Instant::now();

        let supervisor = tokio::spawn(async move {
            let exit = controller.run().await;

            for (name, handle) in [("capture", capture), ("playback", player), ("monitor", monitor)] {
                match tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!("Session: {} task failed: {}", name, e),
                    Err(_) => log::warn!("Session: {} task did not stop in time", name),
                }
            }

            let report = SessionReport::new(
                id,
                started_at,
                started.elapsed(),
                exit.state,
                exit.error,
                collect_metrics(&metrics, &queues.0, &queues.1),
            );
            log::info!(
                "Session {}: ended in {} after {}ms",
                id,
                report.final_state,
                report.duration_ms
            );
            report
        });

        events_tx
            .try_send(Event::Start)
            .map_err(|_| EngineError::ControllerClosed)?;

        self.running = Some(Running {
            events: events_tx,
            trigger,
            stop,
            transmit_queue,
            monitor_queue,
            supervisor,
        });
        Ok(())
    }

    /// Request shutdown and wait for every task to finish.
    ///
    /// A session that already ended on a fatal error still returns its report;
    /// the error is in [`SessionReport::error`].
    pub async fn stop(&mut self) -> Result<SessionReport, EngineError> {
        let running = self.running.as_mut().ok_or(EngineError::ControllerClosed)?;

        log::info!("Session {}: stop requested", self.id);
        running.stop.cancel();
        if running.events.send(Event::Stop).await.is_err() {
            log::debug!("Session {}: controller already finished", self.id);
        }

        self.wait().await
    }

    /// Wait for the session to end on its own (a fatal error).
    ///
    /// Cancel safe: dropping the future leaves the session running.
    pub async fn wait(&mut self) -> Result<SessionReport, EngineError> {
        let running = self.running.as_mut().ok_or(EngineError::ControllerClosed)?;
        let result = (&mut running.supervisor).await;
        self.running = None;

        result.map_err(|e| {
            log::error!("Session {}: supervisor failed: {}", self.id, e);
            EngineError::ControllerClosed
        })
    }

    /// Ask for a barge-in as if the monitor had detected one.
    ///
    /// Returns `false` unless the bot is speaking and no flush is in flight.
    pub fn interrupt(&self) -> bool {
        let Some(running) = self.running.as_ref() else {
            return false;
        };
        let snapshot = *self.state_rx.borrow();
        if snapshot.state != SessionState::BotSpeaking {
            return false;
        }

        log::info!("Session {}: interrupt requested", self.id);
        running.trigger.fire(
            snapshot.generation,
            InterruptionSignal {
                rms: 0.0,
                energy_delta: 0.0,
                zcr: 0.0,
                interrupt: true,
            },
        )
    }

    /// The single-flight trigger shared with the monitor
    pub fn flush_trigger(&self) -> Option<FlushTrigger> {
        self.running.as_ref().map(|running| running.trigger.clone())
    }

    pub fn current_state(&self) -> SessionState {
        self.state_rx.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        *self.state_rx.borrow()
    }

    pub fn is_bot_speaking(&self) -> bool {
        self.current_state() == SessionState::BotSpeaking
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    /// Live counter values
    pub fn metrics(&self) -> MetricsSnapshot {
        match self.running.as_ref() {
            Some(running) => {
                collect_metrics(&self.metrics, &running.transmit_queue, &running.monitor_queue)
            }
            None => self.metrics.snapshot(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            log::debug!("Session {}: dropped while running, stopping", self.id);
            running.stop.cancel();
            let _ = running.events.try_send(Event::Stop);
        }
    }
}

fn collect_metrics(
    metrics: &EngineMetrics,
    transmit_queue: &FrameSubscriber,
    monitor_queue: &FrameSubscriber,
) -> MetricsSnapshot {
    let mut snapshot = metrics.snapshot();
    snapshot.transmit_frames_dropped = transmit_queue.dropped();
    snapshot.monitor_frames_dropped = monitor_queue.dropped();
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MockInput, MockOutput};
    use crate::remote::MockConnector;

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.audio.frame_samples = 0;
        assert!(matches!(
            SessionHandle::new(config),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_not_started() {
        let mut session = SessionHandle::new(EngineConfig::default()).unwrap();
        assert_eq!(session.current_state(), SessionState::Idle);
        assert!(!session.interrupt());
        assert!(session.flush_trigger().is_none());
        assert!(matches!(
            session.stop().await,
            Err(EngineError::ControllerClosed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_start_twice_fails() {
        let mut session = SessionHandle::new(EngineConfig::default()).unwrap();
        let (connector, _remote) = MockConnector::new();
        let connector = Arc::new(connector);

        let (input, _) = MockInput::new(16000);
        let (output, _) = MockOutput::new(24000);
        session.start(input, output, connector.clone()).unwrap();

        let (input, _) = MockInput::new(16000);
        let (output, _) = MockOutput::new(24000);
        assert!(matches!(
            session.start(input, output, connector),
            Err(EngineError::AlreadyStarted)
        ));

        let report = session.stop().await.unwrap();
        assert_eq!(report.final_state, SessionState::ShuttingDown);
        assert!(report.error().is_none());
    }
}
