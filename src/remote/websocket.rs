//! Speech service WebSocket client
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket, receive `session.created`, send config
//! 2. `send_frame()` - Stream captured frames
//! 3. Background reader maps server messages to [`InboundEvent`]s
//! 4. `close()` - Cancel any in-flight response and close the socket
//!
//! Retries are not handled here; see [`super::retry::connect_with_retry`].

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::connection::{FrameSink, InboundEvent, RemoteConnection, SpeechConnector};
use super::protocol::{decode_audio, ClientMessage, ServerMessage};
use crate::audio::AudioFrame;
use crate::error::ConnectionError;
use crate::settings::EngineConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound event buffer between the socket reader and the receive task
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Environment variable holding the service API key
pub const API_KEY_ENV: &str = "SPEECH_API_KEY";

/// Get the speech service API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty())
}

/// Opens WebSocket sessions against a configured endpoint
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    api_key: String,
    input_sample_rate: u32,
    output_sample_rate: u32,
    channels: u16,
    connect_timeout: Duration,
    session_timeout: Duration,
}

impl WsConnector {
    /// Build a connector from the engine config.
    ///
    /// Fails if no endpoint is configured or no API key is available.
    pub fn from_config(config: &EngineConfig, api_key: Option<String>) -> Result<Self, ConnectionError> {
        let url = config.remote.url.clone().ok_or_else(|| {
            ConnectionError::ConnectionFailed("No speech service URL configured".to_string())
        })?;
        let api_key = api_key.ok_or(ConnectionError::MissingApiKey)?;

        Ok(Self {
            url,
            api_key,
            input_sample_rate: config.audio.input_sample_rate,
            output_sample_rate: config.audio.output_sample_rate,
            channels: config.audio.channels,
            connect_timeout: Duration::from_millis(config.remote.connect_timeout_ms),
            session_timeout: Duration::from_millis(config.remote.session_timeout_ms),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait for `session.created`, skipping anything else
    async fn await_session_created(
        &self,
        read: &mut SplitStream<WsStream>,
    ) -> Result<String, ConnectionError> {
        timeout(self.session_timeout, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::SessionCreated { session }) => {
                            log::info!("Session created: {}", session.id);
                            return Ok(session.id);
                        }
                        Ok(ServerMessage::Error { error }) => {
                            return Err(ConnectionError::AuthenticationFailed(error.message));
                        }
                        Ok(_) => {
                            log::debug!("Ignoring message while waiting for session.created");
                        }
                        Err(e) => {
                            log::warn!("Failed to parse message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        return Err(ConnectionError::Disconnected(
                            "Connection closed before session created".to_string(),
                        ));
                    }
                    Err(e) => {
                        return Err(ConnectionError::ProtocolError(e.to_string()));
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }
            Err(ConnectionError::Disconnected("Stream ended".to_string()))
        })
        .await
        .map_err(|_| ConnectionError::ConnectionFailed("Session creation timeout".to_string()))?
    }
}

#[async_trait]
impl SpeechConnector for WsConnector {
    async fn connect(&self) -> Result<RemoteConnection, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| ConnectionError::AuthenticationFailed(e.to_string()))?,
        );

        log::info!("Connecting to speech service at {}...", self.url);

        let (ws_stream, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(
                request, None, true, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| ConnectionError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        log::info!("WebSocket connected, waiting for session.created...");

        let (write, mut read) = ws_stream.split();
        let session_id = self.await_session_created(&mut read).await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader_task = tokio::spawn(read_events(read, events_tx, self.output_sample_rate));

        let mut sink = WsSink {
            write,
            reader_task,
            channels: self.channels,
            frames_sent: 0,
        };

        sink.send_message(&ClientMessage::session_update(
            self.input_sample_rate,
            self.output_sample_rate,
        ))
        .await?;

        Ok(RemoteConnection {
            id: session_id,
            sink: Box::new(sink),
            events: events_rx,
        })
    }
}

/// Map server messages to inbound events until the socket or the receiver closes
async fn read_events(
    mut read: SplitStream<WsStream>,
    events_tx: mpsc::Sender<InboundEvent>,
    default_rate: u32,
) {
    while let Some(msg_result) = read.next().await {
        let text = match msg_result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                log::info!("WebSocket closed by server");
                break;
            }
            Err(e) => {
                log::warn!("WebSocket error: {}", e);
                break;
            }
            _ => continue, // Ignore ping/pong/binary
        };

        let msg = match serde_json::from_str::<ServerMessage>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to parse message: {}", e);
                continue;
            }
        };

        let Some(event) = map_server_message(msg, default_rate) else {
            continue;
        };

        if events_tx.send(event).await.is_err() {
            log::debug!("Receiver channel closed");
            break;
        }
    }
    log::debug!("Reader task exiting");
}

/// Translate one server message, or `None` for messages the engine ignores
fn map_server_message(msg: ServerMessage, default_rate: u32) -> Option<InboundEvent> {
    match msg {
        ServerMessage::AudioDelta { delta, sample_rate } => match decode_audio(&delta) {
            Ok(pcm) => Some(InboundEvent::Audio {
                pcm,
                sample_rate: sample_rate.unwrap_or(default_rate),
            }),
            Err(e) => {
                log::warn!("Dropping undecodable audio delta: {}", e);
                None
            }
        },
        ServerMessage::ResponseDone => Some(InboundEvent::EndOfResponse),
        ServerMessage::InputTranscriptCompleted { transcript } => {
            Some(InboundEvent::Transcript(transcript))
        }
        ServerMessage::ResponseTranscriptDelta { delta } => Some(InboundEvent::ResponseText(delta)),
        ServerMessage::Error { error } => Some(InboundEvent::Error(error.message)),
        ServerMessage::SessionUpdated { session } => {
            log::info!("Session configured: {:?}", session.modalities);
            None
        }
        ServerMessage::SessionCreated { .. } | ServerMessage::Unknown => None,
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
    reader_task: tokio::task::JoinHandle<()>,
    channels: u16,
    frames_sent: u64,
}

impl WsSink {
    async fn send_message(&mut self, msg: &ClientMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(msg).map_err(|e| ConnectionError::ProtocolError(e.to_string()))?;

        self.write
            .send(Message::Text(json))
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: &AudioFrame) -> Result<(), ConnectionError> {
        let msg = ClientMessage::audio_append(
            frame.samples(),
            frame.sample_rate(),
            self.channels,
            frame.sequence(),
        );
        self.send_message(&msg).await?;
        self.frames_sent += 1;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ConnectionError> {
        self.send_message(&ClientMessage::audio_commit()).await
    }

    async fn close(&mut self) {
        log::info!(
            "Disconnecting from speech service ({} frames sent)...",
            self.frames_sent
        );

        self.reader_task.abort();

        // Best effort; the socket may already be gone
        if let Err(e) = self.send_message(&ClientMessage::response_cancel()).await {
            log::debug!("Could not send response.cancel: {}", e);
        }
        if let Err(e) = self.write.close().await {
            log::warn!("Error closing WebSocket: {}", e);
        }
    }
}

impl Drop for WsSink {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
