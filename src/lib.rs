//! Real-time duplex voice engine with barge-in
//!
//! Captures microphone audio, streams it to a remote speech service, plays
//! the synthesized reply, and cuts the reply off the moment the user starts
//! talking over it. See [`engine`] for the task layout and
//! [`state_machine`] for the session graph.

pub mod audio;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod remote;
pub mod settings;
pub mod state_machine;

pub use engine::{InterruptionSignal, SessionHandle};
pub use error::{ConfigError, ConnectionError, DeviceError, EngineError};
pub use metrics::{MetricsSnapshot, SessionReport};
pub use settings::EngineConfig;
pub use state_machine::{SessionSnapshot, SessionState};
