//! In-memory audio devices for tests and offline runs
//!
//! `MockInput` plays back scripted samples and then silence, paced at the
//! real-time cadence of the requested chunk size. `MockOutput` records every
//! write. Both hand out a cloneable control handle so a test can drive the
//! device after it has been moved into the engine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::device::{InputDevice, OutputDevice};
use crate::error::DeviceError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn chunk_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples as u64 * 1_000_000 / sample_rate as u64)
}

#[derive(Debug, Default)]
struct InputScript {
    pending: VecDeque<i16>,
    failure: Option<String>,
    chunks_read: u64,
    overruns: u64,
}

/// Control handle for a [`MockInput`]
#[derive(Debug, Clone, Default)]
pub struct MockInputControl {
    script: Arc<Mutex<InputScript>>,
}

impl MockInputControl {
    /// Queue samples to be returned by subsequent reads
    pub fn push_samples(&self, samples: &[i16]) {
        lock(&self.script).pending.extend(samples.iter().copied());
    }

    /// Queue `count` copies of a constant-amplitude chunk
    pub fn push_constant(&self, value: i16, samples: usize) {
        lock(&self.script)
            .pending
            .extend(std::iter::repeat(value).take(samples));
    }

    /// Make the next read fail with the given message
    pub fn fail(&self, message: impl Into<String>) {
        lock(&self.script).failure = Some(message.into());
    }

    /// Report `samples` as lost by the hardware buffer
    pub fn overrun(&self, samples: u64) {
        lock(&self.script).overruns += samples;
    }

    /// Samples queued but not yet read
    pub fn pending(&self) -> usize {
        lock(&self.script).pending.len()
    }

    pub fn chunks_read(&self) -> u64 {
        lock(&self.script).chunks_read
    }
}

/// Scripted input device
#[derive(Debug)]
pub struct MockInput {
    control: MockInputControl,
    sample_rate: u32,
    pace: bool,
}

impl MockInput {
    /// Create a real-time paced input at `sample_rate`
    pub fn new(sample_rate: u32) -> (Self, MockInputControl) {
        let control = MockInputControl::default();
        (
            Self {
                control: control.clone(),
                sample_rate,
                pace: true,
            },
            control,
        )
    }

    /// Return chunks as fast as they are requested
    pub fn unpaced(mut self) -> Self {
        self.pace = false;
        self
    }
}

impl InputDevice for MockInput {
    fn read_chunk(&mut self, buf: &mut [i16]) -> Result<(), DeviceError> {
        if self.pace {
            thread::sleep(chunk_duration(buf.len(), self.sample_rate));
        } else {
            thread::yield_now();
        }

        let mut script = lock(&self.control.script);
        if let Some(message) = script.failure.take() {
            return Err(DeviceError::ReadFailed(message));
        }

        for slot in buf.iter_mut() {
            *slot = script.pending.pop_front().unwrap_or(0);
        }
        script.chunks_read += 1;
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn overruns(&self) -> u64 {
        lock(&self.control.script).overruns
    }
}

#[derive(Debug, Default)]
struct OutputLog {
    written: Vec<i16>,
    writes: u64,
    silent_writes: u64,
    discards: u64,
    failure: Option<String>,
}

/// Control handle for a [`MockOutput`]
#[derive(Debug, Clone, Default)]
pub struct MockOutputControl {
    log: Arc<Mutex<OutputLog>>,
}

impl MockOutputControl {
    /// All non-silent samples written so far, in write order
    pub fn written(&self) -> Vec<i16> {
        lock(&self.log).written.clone()
    }

    /// Total `write_chunk` calls
    pub fn writes(&self) -> u64 {
        lock(&self.log).writes
    }

    /// Writes that consisted entirely of silence
    pub fn silent_writes(&self) -> u64 {
        lock(&self.log).silent_writes
    }

    /// Times the device was asked to discard buffered audio
    pub fn discards(&self) -> u64 {
        lock(&self.log).discards
    }

    /// Make the next write fail with the given message
    pub fn fail(&self, message: impl Into<String>) {
        lock(&self.log).failure = Some(message.into());
    }
}

/// Recording output device
#[derive(Debug)]
pub struct MockOutput {
    control: MockOutputControl,
    sample_rate: u32,
    pace: bool,
}

impl MockOutput {
    /// Create a real-time paced output at `sample_rate`
    pub fn new(sample_rate: u32) -> (Self, MockOutputControl) {
        let control = MockOutputControl::default();
        (
            Self {
                control: control.clone(),
                sample_rate,
                pace: true,
            },
            control,
        )
    }

    /// Accept writes without waiting for the simulated device clock
    pub fn unpaced(mut self) -> Self {
        self.pace = false;
        self
    }
}

impl OutputDevice for MockOutput {
    fn write_chunk(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        {
            let mut log = lock(&self.control.log);
            if let Some(message) = log.failure.take() {
                return Err(DeviceError::WriteFailed(message));
            }

            log.writes += 1;
            if samples.iter().all(|&s| s == 0) {
                log.silent_writes += 1;
            } else {
                log.written.extend_from_slice(samples);
            }
        }

        if self.pace {
            thread::sleep(chunk_duration(samples.len(), self.sample_rate));
        } else {
            thread::yield_now();
        }
        Ok(())
    }

    fn discard(&mut self) {
        lock(&self.control.log).discards += 1;
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_input_plays_script_then_silence() {
        let (input, control) = MockInput::new(16000);
        let mut input = input.unpaced();
        control.push_samples(&[1, 2, 3]);

        let mut buf = [9i16; 4];
        input.read_chunk(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 0]);

        input.read_chunk(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
        assert_eq!(control.chunks_read(), 2);
    }

    #[test]
    fn test_mock_input_failure() {
        let (input, control) = MockInput::new(16000);
        let mut input = input.unpaced();
        control.fail("unplugged");

        let mut buf = [0i16; 4];
        let err = input.read_chunk(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unplugged"));
    }

    #[test]
    fn test_mock_output_records_writes() {
        let (output, control) = MockOutput::new(24000);
        let mut output = output.unpaced();

        output.write_chunk(&[5, 6]).unwrap();
        output.write_chunk(&[0, 0]).unwrap();
        output.discard();

        assert_eq!(control.written(), vec![5, 6]);
        assert_eq!(control.writes(), 2);
        assert_eq!(control.silent_writes(), 1);
        assert_eq!(control.discards(), 1);
    }

    #[test]
    fn test_chunk_duration() {
        assert_eq!(chunk_duration(256, 16000), Duration::from_millis(16));
        assert_eq!(chunk_duration(480, 24000), Duration::from_millis(20));
        assert_eq!(chunk_duration(10, 0), Duration::ZERO);
    }
}
