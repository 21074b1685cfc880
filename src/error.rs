//! Error taxonomy for the duplex voice engine
//!
//! - [`DeviceError`]: input or output hardware failed. Fatal to the session, never retried.
//! - [`ConnectionError`]: the remote speech stream failed. Retried with bounded backoff;
//!   [`ConnectionError::RetriesExhausted`] is fatal.
//! - [`ConfigError`]: configuration could not be read, parsed, validated or written.
//!
//! Queue overflow and duplicate barge-in triggers are not errors. They are resolved
//! locally (drop-oldest, single-flight guard) and only show up in the metrics.

use std::sync::Arc;

/// Errors raised by audio input/output devices.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Failed to read from input device: {0}")]
    ReadFailed(String),
    #[error("Failed to write to output device: {0}")]
    WriteFailed(String),
    #[error("Audio device closed")]
    Closed,
}

/// Errors raised by the remote speech connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Speech service API key not configured. Set SPEECH_API_KEY environment variable.")]
    MissingApiKey,
    #[error("Failed to connect to speech service: {0}")]
    ConnectionFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("WebSocket protocol error: {0}")]
    ProtocolError(String),
    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),
    #[error("Failed to send audio: {0}")]
    SendFailed(String),
    #[error("Connection failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ConnectionError>,
    },
}

/// Errors raised while loading or saving [`crate::settings::EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("Failed to write config {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error("{path} already exists (use --force to overwrite)")]
    AlreadyExists { path: String },
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Top-level engine error, as seen by the session owner.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Configuration error: {0}")]
    Config(#[source] Arc<ConfigError>),
    #[error("Session already started")]
    AlreadyStarted,
    #[error("Session controller is no longer running")]
    ControllerClosed,
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Config(Arc::new(err))
    }
}

impl EngineError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Device(_) => true,
            EngineError::Connection(ConnectionError::RetriesExhausted { .. }) => true,
            EngineError::Connection(ConnectionError::MissingApiKey) => true,
            EngineError::Connection(_) => false,
            EngineError::Config(_) => true,
            EngineError::AlreadyStarted => false,
            EngineError::ControllerClosed => true,
        }
    }
}
