//! Streaming sample rate conversion
//!
//! Device rates (44.1kHz and 48kHz are common) rarely match the engine's frame
//! rate (16kHz in) or the synthesized audio rate (24kHz out), and the ratio is
//! often not an integer. A [`RateConverter`] wraps an FFT resampler and keeps
//! its filter state plus any partial input block between calls, so chunks of
//! any size convert as one continuous stream.

use rubato::{FftFixedIn, Resampler};

/// Input block length, in milliseconds of source audio
const BLOCK_MS: usize = 10;

#[derive(Debug, Clone, thiserror::Error)]
#[error("Cannot resample {from} Hz to {to} Hz: {message}")]
pub struct ResampleError {
    pub from: u32,
    pub to: u32,
    pub message: String,
}

/// Mono PCM16 rate converter for one continuous stream
pub struct RateConverter {
    from: u32,
    to: u32,
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl std::fmt::Debug for RateConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateConverter")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl RateConverter {
    pub fn new(from: u32, to: u32) -> Result<Self, ResampleError> {
        let fail = |message: String| ResampleError { from, to, message };

        if from == 0 || to == 0 {
            return Err(fail("sample rate must be non-zero".to_string()));
        }

        let inner = if from == to {
            None
        } else {
            let block = (from as usize * BLOCK_MS / 1000).max(1);
            let resampler = FftFixedIn::<f32>::new(from as usize, to as usize, block, 1, 1)
                .map_err(|e| fail(e.to_string()))?;
            log::debug!(
                "Resampler {} Hz -> {} Hz, {} input frames per block",
                from,
                to,
                resampler.input_frames_next()
            );
            Some(resampler)
        };

        Ok(Self {
            from,
            to,
            inner,
            pending: Vec::new(),
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.from
    }

    pub fn target_rate(&self) -> u32 {
        self.to
    }

    /// Convert the next piece of the stream.
    ///
    /// Input that does not fill a whole block is held until the next call.
    pub fn process(&mut self, samples: &[i16]) -> Result<Vec<i16>, ResampleError> {
        let (from, to) = (self.from, self.to);
        let Some(inner) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend(samples.iter().map(|&s| i16_to_f32(s)));

        let mut out = Vec::new();
        loop {
            let needed = inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let block: Vec<f32> = self.pending.drain(..needed).collect();
            let converted = inner.process(&[block], None).map_err(|e| ResampleError {
                from,
                to,
                message: e.to_string(),
            })?;
            if let Some(channel) = converted.first() {
                out.extend(channel.iter().map(|&s| f32_to_i16(s)));
            }
        }
        Ok(out)
    }

    /// Convert whatever partial block is held, padding it with silence
    pub fn finish(&mut self) -> Result<Vec<i16>, ResampleError> {
        let (from, to) = (self.from, self.to);
        let Some(inner) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let held = self.pending.len();
        let block = std::mem::take(&mut self.pending);
        let converted = inner
            .process_partial(Some(&[block]), None)
            .map_err(|e| ResampleError {
                from,
                to,
                message: e.to_string(),
            })?;

        // Only the share of the output that corresponds to real input
        let keep = (held as u64 * to as u64 / from as u64) as usize;
        Ok(converted
            .first()
            .map(|channel| {
                channel
                    .iter()
                    .take(keep)
                    .map(|&s| f32_to_i16(s))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Forget held input and filter history
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Average interleaved channels down to mono
pub fn mix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}
