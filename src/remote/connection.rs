//! Transport-independent view of a remote speech session
//!
//! A [`RemoteConnection`] is split on creation: the outbound [`FrameSink`] is
//! owned by the transmit task, the inbound event receiver by the receive task.
//! Connections are never reused after a flush; the controller drops both halves
//! and asks the [`SpeechConnector`] for a fresh one.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::AudioFrame;
use crate::error::ConnectionError;

/// Events produced by the remote side
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A chunk of synthesized speech; arbitrary length
    Audio { pcm: Vec<i16>, sample_rate: u32 },
    /// The current response has been fully sent
    EndOfResponse,
    /// Transcription of what the user said
    Transcript(String),
    /// Text of the spoken response
    ResponseText(String),
    /// Non-fatal error reported by the service
    Error(String),
}

/// Outbound half of a remote session
#[async_trait]
pub trait FrameSink: Send {
    /// Stream one captured frame
    async fn send_frame(&mut self, frame: &AudioFrame) -> Result<(), ConnectionError>;

    /// Mark the end of the user's turn
    async fn commit(&mut self) -> Result<(), ConnectionError>;

    /// Tear down the session. Must be safe to call on a broken connection.
    async fn close(&mut self);
}

/// A freshly opened remote session
pub struct RemoteConnection {
    /// Identifier assigned by the service, for logging
    pub id: String,
    pub sink: Box<dyn FrameSink>,
    pub events: mpsc::Receiver<InboundEvent>,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Opens remote sessions
#[async_trait]
pub trait SpeechConnector: Send + Sync + 'static {
    /// Single connection attempt (no retries)
    async fn connect(&self) -> Result<RemoteConnection, ConnectionError>;
}
