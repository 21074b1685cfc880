use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

const CONFIG_DIR_NAME: &str = "duplex-voice";
const CONFIG_FILE_NAME: &str = "config.json";

/// Overrides `remote.url` when set
pub const WS_URL_ENV: &str = "SPEECH_WS_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture rate delivered to the engine (Hz).
    pub input_sample_rate: u32,

    /// Samples per captured frame. 256 at 16kHz is a 16ms cadence.
    pub frame_samples: usize,

    /// Rate synthesized audio is played at (Hz).
    pub output_sample_rate: u32,

    /// Samples per playback device write. 480 at 24kHz is 20ms.
    pub output_chunk_samples: usize,

    /// Channels reported to the remote service. Capture is always mixed to mono.
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            frame_samples: 256,
            output_sample_rate: 24000,
            output_chunk_samples: 480,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Frames buffered for the transmit branch (drop-oldest).
    pub transmit_capacity: usize,

    /// Frames buffered for the interruption monitor (drop-oldest).
    pub monitor_capacity: usize,

    /// Synthesized chunks buffered for playback (backpressure).
    pub playback_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            transmit_capacity: 256,
            monitor_capacity: 256,
            playback_capacity: 512,
        }
    }
}

/// Barge-in thresholds. Any one exceeded triggers an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionConfig {
    /// Normalized RMS (0.0-1.0) above which the frame counts as speech.
    pub rms_threshold: f32,

    /// Frame-over-frame RMS rise that counts as an onset.
    pub spike_threshold: f32,

    /// Zero-crossing rate (crossings per sample) that counts as voiced.
    pub voice_threshold: f32,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            rms_threshold: 0.01,
            spike_threshold: 0.008,
            voice_threshold: 0.15,
        }
    }
}

/// Client-side end-of-turn detection while listening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Normalized RMS below which a frame is silence.
    pub silence_threshold: f32,

    /// Silence after speech that ends the user's turn.
    pub silence_duration_ms: u64,

    /// Longest turn before it is committed regardless of silence.
    pub max_utterance_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.01,
            silence_duration_ms: 1000,
            max_utterance_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Connection attempts before the session is failed.
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles each time.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// WebSocket endpoint of the speech service.
    pub url: Option<String>,

    pub connect_timeout_ms: u64,

    /// How long to wait for `session.created` after connecting.
    pub session_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_ms: 10_000,
            session_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub queues: QueueConfig,
    pub interruption: InterruptionConfig,
    pub turn: TurnConfig,
    pub retry: RetryConfig,
    pub remote: RemoteConfig,
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let audio = &self.audio;
        if audio.input_sample_rate == 0 || audio.output_sample_rate == 0 {
            return Err(ConfigError::Invalid("sample rates must be non-zero".into()));
        }
        if audio.frame_samples == 0 || audio.output_chunk_samples == 0 {
            return Err(ConfigError::Invalid("frame sizes must be non-zero".into()));
        }
        if audio.channels == 0 {
            return Err(ConfigError::Invalid("channels must be non-zero".into()));
        }

        let queues = &self.queues;
        if queues.transmit_capacity == 0
            || queues.monitor_capacity == 0
            || queues.playback_capacity == 0
        {
            return Err(ConfigError::Invalid("queue capacities must be non-zero".into()));
        }

        let thresholds = [
            ("rms_threshold", self.interruption.rms_threshold),
            ("spike_threshold", self.interruption.spike_threshold),
            ("voice_threshold", self.interruption.voice_threshold),
            ("silence_threshold", self.turn.silence_threshold),
        ];
        for (name, value) in thresholds {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }

        Ok(())
    }

    /// Apply environment overrides (currently only the endpoint URL)
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = std::env::var(WS_URL_ENV).ok().filter(|u| !u.is_empty()) {
            log::debug!("Settings: remote.url overridden by {}", WS_URL_ENV);
            self.remote.url = Some(url);
        }
    }
}

/// `<config_dir>/duplex-voice/config.json`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load the config at `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            serde_json::from_str::<EngineConfig>(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("Settings: {:?} not found, using defaults", path);
            Ok(EngineConfig::default())
        }
        Err(source) => Err(ConfigError::Read {
            path: path.display().to_string(),
            source,
        }),
    }
}

pub fn save_config(path: &Path, config: &EngineConfig) -> Result<(), ConfigError> {
    let write_err = |source: std::io::Error| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let contents = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(write_err)?;

    // On Windows, rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(write_err(e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(write_err)?;
    log::info!("Settings: wrote {:?}", path);
    Ok(())
}
