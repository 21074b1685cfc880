//! Metrics collection for the duplex engine
//!
//! Lock-free counters shared by every task, and the report returned when a
//! session ends. Overflow and duplicate barge-in triggers are never errors;
//! this is where they show up.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::error::EngineError;
use crate::state_machine::SessionState;

/// Named engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    FramesCaptured,
    /// Samples the input device dropped before they reached the engine
    InputOverruns,
    FramesTransmitted,
    /// Frames removed from the fan-out queues by a flush
    FramesDiscarded,
    QueriesCommitted,
    ChunksReceived,
    /// Silence written while the bot was expected to be speaking
    PlaybackUnderruns,
    InterruptsDetected,
    /// Barge-in triggers rejected by the single-flight guard
    DuplicateTriggers,
    Flushes,
    Reconnects,
}

impl Counter {
    const COUNT: usize = 11;

    fn index(self) -> usize {
        self as usize
    }
}

/// Shared atomic counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    counters: [AtomicU64; Counter::COUNT],
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_captured: self.get(Counter::FramesCaptured),
            input_samples_dropped: self.get(Counter::InputOverruns),
            frames_transmitted: self.get(Counter::FramesTransmitted),
            frames_discarded: self.get(Counter::FramesDiscarded),
            transmit_frames_dropped: 0,
            monitor_frames_dropped: 0,
            queries_committed: self.get(Counter::QueriesCommitted),
            chunks_received: self.get(Counter::ChunksReceived),
            playback_underruns: self.get(Counter::PlaybackUnderruns),
            interrupts_detected: self.get(Counter::InterruptsDetected),
            duplicate_triggers: self.get(Counter::DuplicateTriggers),
            flushes: self.get(Counter::Flushes),
            reconnects: self.get(Counter::Reconnects),
        }
    }
}

/// Counter values at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub input_samples_dropped: u64,
    pub frames_transmitted: u64,
    pub frames_discarded: u64,
    /// Frames evicted by the transmit branch's drop-oldest policy
    pub transmit_frames_dropped: u64,
    /// Frames evicted by the monitor branch's drop-oldest policy
    pub monitor_frames_dropped: u64,
    pub queries_committed: u64,
    pub chunks_received: u64,
    pub playback_underruns: u64,
    pub interrupts_detected: u64,
    pub duplicate_triggers: u64,
    pub flushes: u64,
    pub reconnects: u64,
}

/// Summary of a finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub final_state: SessionState,
    /// Display form of the fatal error, if the session failed
    pub fatal_error: Option<String>,
    pub metrics: MetricsSnapshot,
    #[serde(skip)]
    error: Option<EngineError>,
}

impl SessionReport {
    pub fn new(
        session_id: Uuid,
        started_at: DateTime<Utc>,
        duration: Duration,
        final_state: SessionState,
        error: Option<EngineError>,
        metrics: MetricsSnapshot,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at,
            duration_ms: duration.as_millis() as u64,
            final_state,
            fatal_error: error.as_ref().map(|e| e.to_string()),
            metrics,
            error,
        }
    }

    /// The error that ended the session, if any
    pub fn error(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }

    /// `Err` if the session ended on a fatal error
    pub fn into_result(mut self) -> Result<SessionReport, EngineError> {
        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;

    #[test]
    fn test_new_metrics_are_zero() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters_are_independent() {
        let metrics = EngineMetrics::new();
        metrics.incr(Counter::FramesCaptured);
        metrics.incr(Counter::FramesCaptured);
        metrics.add(Counter::FramesDiscarded, 5);
        metrics.incr(Counter::Reconnects);
        metrics.add(Counter::InputOverruns, 480);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_captured, 2);
        assert_eq!(snapshot.frames_discarded, 5);
        assert_eq!(snapshot.reconnects, 1);
        assert_eq!(snapshot.input_samples_dropped, 480);
        assert_eq!(snapshot.flushes, 0);
    }

    #[test]
    fn test_counter_indices_fit() {
        // Last variant must index inside the array
        assert_eq!(Counter::Reconnects.index(), Counter::COUNT - 1);
    }

    #[test]
    fn test_report_serialization() {
        let report = SessionReport::new(
            Uuid::new_v4(),
            Utc::now(),
            Duration::from_millis(1500),
            SessionState::ShuttingDown,
            None,
            MetricsSnapshot::default(),
        );
        let json = serde_json::to_string(&report).unwrap();

        assert!(json.contains("\"final_state\":\"ShuttingDown\""));
        assert!(json.contains("\"duration_ms\":1500"));
        assert!(json.contains("\"fatal_error\":null"));
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_report_carries_fatal_error() {
        let report = SessionReport::new(
            Uuid::new_v4(),
            Utc::now(),
            Duration::ZERO,
            SessionState::Idle,
            Some(EngineError::Device(DeviceError::ReadFailed("unplugged".into()))),
            MetricsSnapshot::default(),
        );

        assert!(report.fatal_error.as_deref().unwrap().contains("unplugged"));
        assert!(report.error().is_some());
        assert!(matches!(report.into_result(), Err(EngineError::Device(_))));
    }
}
