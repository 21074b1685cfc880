//! In-memory speech service for tests and offline runs
//!
//! [`MockConnector`] hands out connections whose outbound frames are recorded
//! and whose inbound events are driven through the paired [`MockRemote`]
//! handle. Optionally replies to every commit with a scripted response.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::connection::{FrameSink, InboundEvent, RemoteConnection, SpeechConnector};
use crate::audio::AudioFrame;
use crate::error::ConnectionError;

/// Inbound event buffer per mock connection
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct ConnectionRecord {
    frames: Vec<(u64, Vec<i16>)>,
    commits: u32,
    closed: bool,
    broken: bool,
    events_tx: Option<mpsc::Sender<InboundEvent>>,
}

#[derive(Debug)]
struct MockState {
    connections: Vec<ConnectionRecord>,
    connect_attempts: u32,
    fail_connects: u32,
    reply: Option<Vec<Vec<i16>>>,
    reply_rate: u32,
    /// `close` never completes, like a peer that stopped reading
    stall_close: bool,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test-side handle to the mock service
#[derive(Debug, Clone)]
pub struct MockRemote {
    state: Arc<Mutex<MockState>>,
}

/// [`SpeechConnector`] backed by a [`MockRemote`]
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> (Self, MockRemote) {
        let state = Arc::new(Mutex::new(MockState {
            connections: Vec::new(),
            connect_attempts: 0,
            fail_connects: 0,
            reply: None,
            reply_rate: 24000,
            stall_close: false,
        }));
        (
            Self {
                state: state.clone(),
            },
            MockRemote { state },
        )
    }
}

#[async_trait]
impl SpeechConnector for MockConnector {
    async fn connect(&self) -> Result<RemoteConnection, ConnectionError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ConnectionError::ConnectionFailed(
                "mock connection refused".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let index = state.connections.len();
        state.connections.push(ConnectionRecord {
            events_tx: Some(tx),
            ..Default::default()
        });

        log::debug!("MockRemote: opened connection {}", index);

        Ok(RemoteConnection {
            id: format!("mock_{}", index),
            sink: Box::new(MockSink {
                state: self.state.clone(),
                index,
            }),
            events: rx,
        })
    }
}

struct MockSink {
    state: Arc<Mutex<MockState>>,
    index: usize,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_frame(&mut self, frame: &AudioFrame) -> Result<(), ConnectionError> {
        let mut state = lock(&self.state);
        let record = &mut state.connections[self.index];
        if record.broken {
            return Err(ConnectionError::Disconnected("mock connection lost".to_string()));
        }
        if record.closed {
            return Err(ConnectionError::SendFailed("connection closed".to_string()));
        }
        record.frames.push((frame.sequence(), frame.samples().to_vec()));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ConnectionError> {
        let mut state = lock(&self.state);
        let reply = state.reply.clone();
        let reply_rate = state.reply_rate;
        let record = &mut state.connections[self.index];
        if record.broken || record.closed {
            return Err(ConnectionError::SendFailed("connection closed".to_string()));
        }
        record.commits += 1;

        if let (Some(chunks), Some(tx)) = (reply, record.events_tx.as_ref()) {
            for pcm in chunks {
                let _ = tx.try_send(InboundEvent::Audio {
                    pcm,
                    sample_rate: reply_rate,
                });
            }
            let _ = tx.try_send(InboundEvent::EndOfResponse);
        }
        Ok(())
    }

    async fn close(&mut self) {
        let stall = {
            let mut state = lock(&self.state);
            let stall = state.stall_close;
            let record = &mut state.connections[self.index];
            record.closed = true;
            record.events_tx = None;
            stall
        };
        if stall {
            std::future::pending::<()>().await;
        }
    }
}

impl MockRemote {
    /// Fail the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.state).fail_connects = count;
    }

    /// Reply to every commit with these audio chunks followed by end-of-response
    pub fn respond_on_commit(&self, chunks: Vec<Vec<i16>>, sample_rate: u32) {
        let mut state = lock(&self.state);
        state.reply = Some(chunks);
        state.reply_rate = sample_rate;
    }

    /// Make every later `close` hang forever
    pub fn stall_close(&self) {
        lock(&self.state).stall_close = true;
    }

    /// Deliver an event on the most recent connection
    pub fn send(&self, event: InboundEvent) -> bool {
        let state = lock(&self.state);
        state
            .connections
            .last()
            .and_then(|record| record.events_tx.as_ref())
            .map(|tx| tx.try_send(event).is_ok())
            .unwrap_or(false)
    }

    /// Simulate the service dropping the most recent connection
    pub fn drop_connection(&self) {
        let mut state = lock(&self.state);
        if let Some(record) = state.connections.last_mut() {
            record.broken = true;
            record.events_tx = None;
        }
    }

    /// Successful connections so far
    pub fn connections(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    /// Frames received on connection `index` as (sequence, samples)
    pub fn frames(&self, index: usize) -> Vec<(u64, Vec<i16>)> {
        lock(&self.state)
            .connections
            .get(index)
            .map(|record| record.frames.clone())
            .unwrap_or_default()
    }

    /// Sequence numbers received on connection `index`
    pub fn sequences(&self, index: usize) -> Vec<u64> {
        self.frames(index).into_iter().map(|(seq, _)| seq).collect()
    }

    pub fn commits(&self, index: usize) -> u32 {
        lock(&self.state)
            .connections
            .get(index)
            .map(|record| record.commits)
            .unwrap_or(0)
    }

    pub fn is_closed(&self, index: usize) -> bool {
        lock(&self.state)
            .connections
            .get(index)
            .map(|record| record.closed)
            .unwrap_or(false)
    }
}
