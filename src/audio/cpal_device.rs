//! CPAL-backed input and output devices
//!
//! CPAL streams are driven by callbacks on an audio thread and are not `Send` on
//! every platform, so each stream is built and owned by a dedicated thread. The
//! handles exposed here only hold channels and shared buffers, which makes them
//! safe to move into the engine's blocking tasks.
//!
//! ```text
//! Input:  CPAL callback ──ring buffer──▶ CpalInput::read_chunk (engine rate)
//! Output: CpalOutput::write_chunk ──shared ring──▶ CPAL callback (device rate)
//! ```
//!
//! The input callback never blocks. When the reader falls behind and the ring
//! is full, the newest samples are dropped and counted as overruns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::device::{InputDevice, OutputDevice};
use super::resample::{mix_to_mono, RateConverter};
use crate::error::DeviceError;

/// How long `read_chunk` waits for the callback before declaring the device dead
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Captured audio buffered between the audio thread and the reader
const INPUT_BUFFER_MS: usize = 2000;

/// Poll interval while waiting for captured samples
const INPUT_POLL: Duration = Duration::from_millis(2);

/// Output ring level (in ms of device audio) above which writers wait
const OUTPUT_BUFFER_MS: u32 = 100;

/// Poll interval while waiting for output ring space
const OUTPUT_POLL: Duration = Duration::from_millis(2);

type ErrorSlot = Arc<Mutex<Option<String>>>;

/// Name and direction of a CPAL device, for listing
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
}

/// List the default host's input and output devices
pub fn list_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    let host = cpal::default_host();
    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    let default_out = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();

    let inputs = host
        .input_devices()
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;
    for device in inputs {
        let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
        devices.push(DeviceInfo {
            is_default: default_in.as_deref() == Some(name.as_str()),
            name,
            is_input: true,
        });
    }

    let outputs = host
        .output_devices()
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;
    for device in outputs {
        let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
        devices.push(DeviceInfo {
            is_default: default_out.as_deref() == Some(name.as_str()),
            name,
            is_input: false,
        });
    }

    Ok(devices)
}

/// Spawn a thread that builds a stream with `build`, plays it, and keeps it
/// alive until `running` is cleared.
fn spawn_stream_thread<F>(
    name: &str,
    running: Arc<AtomicBool>,
    build: F,
) -> Result<thread::JoinHandle<()>, DeviceError>
where
    F: FnOnce() -> Result<Stream, DeviceError> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::channel::<Result<(), DeviceError>>();

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(DeviceError::StreamCreationFailed(format!(
                    "Failed to start stream: {}",
                    e
                ))));
                return;
            }

            let _ = ready_tx.send(Ok(()));

            while running.load(Ordering::SeqCst) {
                thread::park_timeout(Duration::from_millis(50));
            }

            drop(stream);
        })
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DeviceError::StreamCreationFailed(
            "Stream thread exited during setup".to_string(),
        )),
    }
}

/// Microphone input from the default CPAL input device
pub struct CpalInput {
    consumer: HeapCons<i16>,
    target_rate: u32,
    /// Samples the callback could not buffer
    overruns: Arc<AtomicU64>,
    reported_overruns: u64,
    running: Arc<AtomicBool>,
    stream_error: ErrorSlot,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalInput {
    /// Open the default input device, delivering mono PCM16 at `target_rate`
    pub fn open(target_rate: u32) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(DeviceError::NoInputDevice)?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported = device
            .default_input_config()
            .map_err(|_| DeviceError::NoSupportedConfig)?;

        log::info!(
            "Audio input config: {} Hz, {} channels, {:?}",
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format()
        );

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let converter = RateConverter::new(config.sample_rate.0, target_rate)
            .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;

        let capacity = target_rate as usize * INPUT_BUFFER_MS / 1000;
        let (producer, consumer) = HeapRb::<i16>::new(capacity.max(1)).split();
        let overruns = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let stream_error: ErrorSlot = Arc::new(Mutex::new(None));

        let thread = {
            let sink = InputSink {
                producer,
                converter,
                overruns: overruns.clone(),
                stream_error: stream_error.clone(),
            };
            spawn_stream_thread("duplex-voice-input", running.clone(), move || {
                build_input_stream(&device, &config, sample_format, sink)
            })?
        };

        Ok(Self {
            consumer,
            target_rate,
            overruns,
            reported_overruns: 0,
            running,
            stream_error,
            thread: Some(thread),
        })
    }
}

/// Everything the input callback owns
struct InputSink {
    producer: HeapProd<i16>,
    converter: RateConverter,
    overruns: Arc<AtomicU64>,
    stream_error: ErrorSlot,
}

impl InputSink {
    fn push(&mut self, mono: &[i16]) {
        let samples = match self.converter.process(mono) {
            Ok(samples) => samples,
            Err(e) => {
                *self.stream_error.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(e.to_string());
                return;
            }
        };

        let pushed = self.producer.push_slice(&samples);
        if pushed < samples.len() {
            self.overruns
                .fetch_add((samples.len() - pushed) as u64, Ordering::Relaxed);
        }
    }
}

fn build_input_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    sink: InputSink,
) -> Result<Stream, DeviceError> {
    match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(device, config, sink),
        SampleFormat::U16 => build_input_typed::<u16>(device, config, sink),
        SampleFormat::F32 => build_input_typed::<f32>(device, config, sink),
        _ => Err(DeviceError::NoSupportedConfig),
    }
}

fn build_input_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut sink: InputSink,
) -> Result<Stream, DeviceError>
where
    T: SizedSample + Send + 'static,
    i16: FromSample<T>,
{
    let channels = config.channels;
    let stream_error = sink.stream_error.clone();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let raw: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                sink.push(&mix_to_mono(&raw, channels));
            },
            move |err| {
                log::error!("Audio input stream error: {}", err);
                *stream_error.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(err.to_string());
            },
            None,
        )
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))
}

impl InputDevice for CpalInput {
    fn read_chunk(&mut self, buf: &mut [i16]) -> Result<(), DeviceError> {
        let deadline = Instant::now() + READ_TIMEOUT;

        while self.consumer.occupied_len() < buf.len() {
            if let Some(err) = self
                .stream_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                return Err(DeviceError::ReadFailed(err));
            }
            if self.thread.as_ref().map_or(true, |t| t.is_finished()) {
                return Err(DeviceError::Closed);
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::ReadFailed(format!(
                    "No audio from input device for {:?}",
                    READ_TIMEOUT
                )));
            }
            thread::sleep(INPUT_POLL);
        }

        let read = self.consumer.pop_slice(buf);
        buf[read..].fill(0);

        let overruns = self.overruns.load(Ordering::Relaxed);
        if overruns > self.reported_overruns {
            log::warn!(
                "Audio input overrun: {} samples dropped ({} total)",
                overruns - self.reported_overruns,
                overruns
            );
            self.reported_overruns = overruns;
        }
        Ok(())
    }

    fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    fn sample_rate(&self) -> u32 {
        self.target_rate
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
        }
    }
}

/// Speaker output to the default CPAL output device
pub struct CpalOutput {
    ring: Arc<Mutex<VecDeque<i16>>>,
    source_rate: u32,
    converter: RateConverter,
    max_buffered: usize,
    running: Arc<AtomicBool>,
    stream_error: ErrorSlot,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device, accepting mono PCM16 at `source_rate`
    pub fn open(source_rate: u32) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(DeviceError::NoOutputDevice)?;

        log::info!("Using audio output device: {:?}", device.name());

        let supported = device
            .default_output_config()
            .map_err(|_| DeviceError::NoSupportedConfig)?;

        log::info!(
            "Audio output config: {} Hz, {} channels, {:?}",
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format()
        );

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let device_rate = config.sample_rate.0;
        let converter = RateConverter::new(source_rate, device_rate)
            .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;

        let ring = Arc::new(Mutex::new(VecDeque::new()));
        let running = Arc::new(AtomicBool::new(true));
        let stream_error: ErrorSlot = Arc::new(Mutex::new(None));

        let thread = {
            let ring = ring.clone();
            let stream_error = stream_error.clone();
            spawn_stream_thread("duplex-voice-output", running.clone(), move || {
                build_output_stream(&device, &config, sample_format, ring, stream_error)
            })?
        };

        Ok(Self {
            ring,
            source_rate,
            converter,
            max_buffered: (device_rate * OUTPUT_BUFFER_MS / 1000) as usize,
            running,
            stream_error,
            thread: Some(thread),
        })
    }
}

fn build_output_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    ring: Arc<Mutex<VecDeque<i16>>>,
    stream_error: ErrorSlot,
) -> Result<Stream, DeviceError> {
    match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(device, config, ring, stream_error),
        SampleFormat::U16 => build_output_typed::<u16>(device, config, ring, stream_error),
        SampleFormat::F32 => build_output_typed::<f32>(device, config, ring, stream_error),
        _ => Err(DeviceError::NoSupportedConfig),
    }
}

fn build_output_typed<T>(
    device: &Device,
    config: &StreamConfig,
    ring: Arc<Mutex<VecDeque<i16>>>,
    stream_error: ErrorSlot,
) -> Result<Stream, DeviceError>
where
    T: SizedSample + FromSample<i16> + Send + 'static,
{
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut ring = ring.lock().unwrap_or_else(PoisonError::into_inner);
                for frame in data.chunks_mut(channels) {
                    // Underrun plays silence
                    let sample = T::from_sample(ring.pop_front().unwrap_or(0));
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            move |err| {
                log::error!("Audio output stream error: {}", err);
                *stream_error.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(err.to_string());
            },
            None,
        )
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))
}

impl OutputDevice for CpalOutput {
    fn write_chunk(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        if let Some(err) = self
            .stream_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(DeviceError::WriteFailed(err));
        }

        let converted = self
            .converter
            .process(samples)
            .map_err(|e| DeviceError::WriteFailed(e.to_string()))?;

        // Pace the writer to the device clock
        loop {
            let buffered = self.ring.lock().unwrap_or_else(PoisonError::into_inner).len();
            if buffered < self.max_buffered {
                break;
            }
            if !self.running.load(Ordering::SeqCst) {
                return Err(DeviceError::Closed);
            }
            thread::sleep(OUTPUT_POLL);
        }

        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(converted);
        Ok(())
    }

    fn discard(&mut self) {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.converter.reset();
    }

    fn sample_rate(&self) -> u32 {
        self.source_rate
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
        }
    }
}

/// Convert any sample type to i16
fn sample_to_i16<T>(sample: T) -> i16
where
    T: Sample,
    i16: FromSample<T>,
{
    sample.to_sample::<i16>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), i16::MIN);
        assert_eq!(sample_to_i16(1234i16), 1234);
    }
}
