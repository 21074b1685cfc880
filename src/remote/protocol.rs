//! Speech service wire protocol
//!
//! JSON text frames over WebSocket, discriminated by a `type` field. Audio in
//! both directions is PCM16 little-endian, base64-encoded.
//!
//! # Protocol Overview
//!
//! 1. Connect with `Authorization: Bearer <key>`
//! 2. Receive `session.created`
//! 3. Send `session.update` with the input/output audio formats
//! 4. Stream microphone audio via `input_audio_buffer.append`
//! 5. Send `input_audio_buffer.commit` at the end of the user's turn
//! 6. Receive `response.audio.delta` chunks, then `response.done`

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::audio::{pcm16_from_le_bytes, pcm16_to_le_bytes};

/// Session configuration sent after connecting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Output modalities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// Input audio format, always "pcm16"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_sample_rate: Option<u32>,

    /// Output audio format, always "pcm16"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_sample_rate: Option<u32>,

    /// Turn detection - null for client-side commit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
}

impl SessionConfig {
    /// Audio in and out, turns committed by the client
    pub fn duplex(input_sample_rate: u32, output_sample_rate: u32) -> Self {
        Self {
            modalities: Some(vec!["audio".to_string(), "text".to_string()]),
            input_audio_format: Some("pcm16".to_string()),
            input_sample_rate: Some(input_sample_rate),
            output_audio_format: Some("pcm16".to_string()),
            output_sample_rate: Some(output_sample_rate),
            turn_detection: None,
        }
    }
}

/// Turn detection configuration (null = manual)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub detection_type: String,
}

/// Session information returned by the service
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub modalities: Vec<String>,
}

/// Error information from the service
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: String,

    #[serde(default)]
    pub code: Option<String>,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Append one captured frame to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend {
        /// Base64-encoded PCM16 LE audio
        audio: String,
        sample_rate: u32,
        channels: u16,
        /// Capture sequence number of the frame
        sequence: u64,
    },

    /// End of the user's turn
    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit,

    /// Abandon the response being generated
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientMessage {
    pub fn session_update(input_sample_rate: u32, output_sample_rate: u32) -> Self {
        Self::SessionUpdate {
            session: SessionConfig::duplex(input_sample_rate, output_sample_rate),
        }
    }

    /// Create an audio append message from raw PCM16 samples
    pub fn audio_append(samples: &[i16], sample_rate: u32, channels: u16, sequence: u64) -> Self {
        Self::AudioAppend {
            audio: STANDARD.encode(pcm16_to_le_bytes(samples)),
            sample_rate,
            channels,
            sequence,
        }
    }

    pub fn audio_commit() -> Self {
        Self::AudioCommit
    }

    pub fn response_cancel() -> Self {
        Self::ResponseCancel
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Synthesized audio chunk
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Base64-encoded PCM16 LE audio
        delta: String,
        /// Defaults to the negotiated output rate when absent
        #[serde(default)]
        sample_rate: Option<u32>,
    },

    /// Text of the response being spoken
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseTranscriptDelta { delta: String },

    /// What the service heard from the user
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted { transcript: String },

    /// End of the response stream
    #[serde(rename = "response.done")]
    ResponseDone,

    /// Catch-all for message types we don't handle
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Extract session ID if this is a session created/updated message
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionCreated { session } => Some(&session.id),
            ServerMessage::SessionUpdated { session } => Some(&session.id),
            _ => None,
        }
    }
}

/// Decode a base64 PCM16 LE payload
pub fn decode_audio(payload: &str) -> Result<Vec<i16>, base64::DecodeError> {
    Ok(pcm16_from_le_bytes(&STANDARD.decode(payload)?))
}
