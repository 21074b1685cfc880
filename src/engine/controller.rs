//! The session controller (flush controller)
//!
//! Sole owner of the session snapshot. Events from every task arrive on one
//! channel, go through [`reduce`], and the resulting effects run here, in
//! order, before the next event is read. That serialization is what makes a
//! flush exclusive: while one runs, further triggers wait in the channel and
//! are then dropped as stale or ignored by the `Flushing` state.
//!
//! A pipeline generation is one remote connection plus the transmit and
//! receive tasks bound to it. Each user turn and its reply get their own
//! generation: a flush replaces it mid-reply, a finished reply rotates it.
//! Capture, monitor and playback live for the whole session and follow the
//! generation through the published snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::monitor::FlushTrigger;
use super::playback::PlaybackHandle;
use super::receive::ReceiveTask;
use super::transmit::{TransmitTask, TurnDetector};
use crate::audio::{FanOut, FrameSubscriber};
use crate::error::{ConnectionError, EngineError};
use crate::metrics::{Counter, EngineMetrics};
use crate::remote::{connect_with_retry, FrameSink, RemoteConnection, RetryPolicy, SpeechConnector};
use crate::settings::TurnConfig;
use crate::state_machine::{reduce, Effect, Event, FlushReason, SessionSnapshot, SessionState};

/// Longest a superseded connection may take to close before it is dropped
const CLOSE_TIMEOUT: Duration = Duration::from_millis(250);

/// Tasks bound to one remote connection
struct Pipeline {
    generation: u64,
    cancel: CancellationToken,
    transmit: JoinHandle<Box<dyn FrameSink>>,
    receive: JoinHandle<()>,
}

pub(crate) struct Controller {
    pub snapshot: SessionSnapshot,
    pub state_tx: watch::Sender<SessionSnapshot>,
    pub events_rx: mpsc::Receiver<Event>,
    pub events_tx: mpsc::Sender<Event>,
    pub fanout: Arc<FanOut>,
    pub transmit_queue: FrameSubscriber,
    pub playback: PlaybackHandle,
    pub next_sequence: Arc<AtomicU64>,
    pub trigger: FlushTrigger,
    pub metrics: Arc<EngineMetrics>,
    pub connector: Arc<dyn SpeechConnector>,
    pub retry: RetryPolicy,
    pub turn: TurnConfig,
    pub output_sample_rate: u32,
    /// Cancelled by the session owner on stop; aborts connection attempts
    pub stop: CancellationToken,
    /// Parent of every task token in the session
    pub session: CancellationToken,
}

/// How the controller loop ended
#[derive(Debug)]
pub(crate) struct ControllerExit {
    pub state: SessionState,
    pub error: Option<EngineError>,
}

impl Controller {
    pub async fn run(mut self) -> ControllerExit {
        let mut follow_ups: VecDeque<Event> = VecDeque::new();
        let mut fatal: Option<EngineError> = None;
        let mut pipeline: Option<Pipeline> = None;

        log::info!("FlushController: started");

        loop {
            let event = match follow_ups.pop_front() {
                Some(event) => event,
                None => match self.events_rx.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };

            log::debug!("Received event: {:?}", event);

            if let Event::Fatal { error } = &event {
                if fatal.is_none() {
                    log::error!("FlushController: fatal error: {}", error);
                    fatal = Some(error.clone());
                }
            }

            let (next, effects) = reduce(&self.snapshot, event);
            if next.state != self.snapshot.state {
                log::info!("State transition: {} -> {}", self.snapshot.state, next.state);
            }
            self.snapshot = next;

            for effect in effects {
                match effect {
                    Effect::Publish => self.publish(),
                    Effect::OpenPipeline { generation } => {
                        if let Some(event) = self.open_pipeline(generation, &mut pipeline).await {
                            follow_ups.push_back(event);
                        }
                    }
                    Effect::Flush { generation, reason } => {
                        if let Some(event) = self.flush(generation, reason, &mut pipeline).await {
                            follow_ups.push_back(event);
                        }
                    }
                    Effect::Rotate { generation } => {
                        if let Some(event) = self.rotate(generation, &mut pipeline).await {
                            follow_ups.push_back(event);
                        }
                    }
                    Effect::Shutdown => self.shutdown(&mut pipeline).await,
                }
            }

            // Re-arm barge-in once no flush is running
            if self.snapshot.state != SessionState::Flushing {
                self.trigger.release();
            }

            let finished = match self.snapshot.state {
                SessionState::ShuttingDown => true,
                SessionState::Idle => fatal.is_some(),
                _ => false,
            };
            if finished {
                break;
            }
        }

        // Channel closed without a stop: still release everything
        if pipeline.is_some() || !self.session.is_cancelled() {
            self.shutdown(&mut pipeline).await;
        }

        log::info!("FlushController: stopped in {}", self.snapshot.state);
        ControllerExit {
            state: self.snapshot.state,
            error: fatal,
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot);
    }

    /// Connect under the retry policy, giving up early if the session is stopped
    async fn connect(&self) -> Option<Result<RemoteConnection, ConnectionError>> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                log::info!("FlushController: connect abandoned, session stopping");
                None
            }
            result = connect_with_retry(self.connector.as_ref(), self.retry) => Some(result),
        }
    }

    async fn open_pipeline(
        &self,
        generation: u64,
        pipeline: &mut Option<Pipeline>,
    ) -> Option<Event> {
        let connection = match self.connect().await? {
            Ok(connection) => connection,
            Err(e) => {
                log::error!("FlushController: could not open remote session: {}", e);
                return Some(Event::Fatal { error: e.into() });
            }
        };

        *pipeline = Some(self.spawn_pipeline(generation, connection, 0));
        None
    }

    fn spawn_pipeline(
        &self,
        generation: u64,
        connection: RemoteConnection,
        min_sequence: u64,
    ) -> Pipeline {
        let RemoteConnection { id, sink, events } = connection;
        let cancel = self.session.child_token();

        log::info!(
            "FlushController: generation {} connected ({})",
            generation,
            id
        );

        let transmit = TransmitTask {
            generation,
            queue: self.transmit_queue.clone(),
            sink,
            min_sequence,
            turn: TurnDetector::new(&self.turn),
            state: self.state_tx.subscribe(),
            events: self.events_tx.clone(),
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
        };
        let receive = ReceiveTask {
            generation,
            inbound: events,
            playback: self.playback.clone(),
            output_sample_rate: self.output_sample_rate,
            state: self.state_tx.subscribe(),
            events: self.events_tx.clone(),
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
        };

        Pipeline {
            generation,
            cancel,
            transmit: tokio::spawn(transmit.run()),
            receive: tokio::spawn(receive.run()),
        }
    }

    /// Cancel the current generation, wait for its tasks and close its connection
    async fn teardown(&self, pipeline: &mut Option<Pipeline>) {
        let Some(pipeline) = pipeline.take() else {
            return;
        };

        pipeline.cancel.cancel();

        match pipeline.transmit.await {
            Ok(mut sink) => {
                if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                    log::warn!(
                        "FlushController: generation {} did not close within {:?}, dropping it",
                        pipeline.generation,
                        CLOSE_TIMEOUT
                    );
                }
            }
            Err(e) => log::warn!("FlushController: transmit task failed: {}", e),
        }
        if let Err(e) = pipeline.receive.await {
            log::warn!("FlushController: receive task failed: {}", e);
        }

        log::debug!(
            "FlushController: generation {} torn down",
            pipeline.generation
        );
    }

    /// Replace a finished cycle's connection. Playback has already drained.
    async fn rotate(&self, generation: u64, pipeline: &mut Option<Pipeline>) -> Option<Event> {
        // Frames from the bot's turn were never meant for the next query
        let cutoff = self.next_sequence.load(Ordering::SeqCst);
        self.teardown(pipeline).await;

        let connection = match self.connect().await? {
            Ok(connection) => connection,
            Err(e) => {
                log::error!("FlushController: could not open connection for next turn: {}", e);
                return Some(Event::Fatal { error: e.into() });
            }
        };

        *pipeline = Some(self.spawn_pipeline(generation, connection, cutoff));
        log::info!("FlushController: rotated to generation {} for the next turn", generation);
        None
    }

    async fn flush(
        &self,
        generation: u64,
        reason: FlushReason,
        pipeline: &mut Option<Pipeline>,
    ) -> Option<Event> {
        let started = Instant::now();
        let cutoff = self.next_sequence.load(Ordering::SeqCst);

        // Silence first; everything else can take a moment
        if let Some(current) = pipeline.as_ref() {
            current.cancel.cancel();
        }
        let mut dropped_chunks = self.playback.flush();
        self.teardown(pipeline).await;
        // Receive may have enqueued between the first flush and its cancellation
        dropped_chunks += self.playback.flush();

        let discarded = self.fanout.discard_before(cutoff);
        self.metrics.add(Counter::FramesDiscarded, discarded as u64);
        self.metrics.incr(Counter::Flushes);

        log::info!(
            "FlushController: flush ({:?}) dropped {} playback chunks and {} queued frames before {}",
            reason,
            dropped_chunks,
            discarded,
            cutoff
        );

        let connection = match self.connect().await? {
            Ok(connection) => connection,
            Err(e) => {
                log::error!("FlushController: reconnect after flush failed: {}", e);
                return Some(Event::Fatal { error: e.into() });
            }
        };

        self.metrics.incr(Counter::Reconnects);
        *pipeline = Some(self.spawn_pipeline(generation, connection, cutoff));

        log::info!(
            "FlushController: flush complete in {:?}",
            started.elapsed()
        );
        Some(Event::FlushComplete { generation })
    }

    async fn shutdown(&self, pipeline: &mut Option<Pipeline>) {
        log::info!("FlushController: shutting down session");

        if let Some(current) = pipeline.as_ref() {
            current.cancel.cancel();
        }
        self.playback.flush();
        self.teardown(pipeline).await;
        self.playback.flush();

        self.session.cancel();
        self.fanout.close();
        self.playback.close();
    }
}
