//! Captured audio frames
//!
//! A frame is immutable once created and is shared by reference (`Arc`) between
//! the fan-out branches, so no payload is copied when it is duplicated.

use std::sync::Arc;
use std::time::Instant;

/// Shared handle to a captured frame.
pub type SharedFrame = Arc<AudioFrame>;

/// A fixed-size chunk of captured PCM16 mono samples with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    sequence: u64,
    captured_at: Instant,
}

impl AudioFrame {
    /// Create a new frame stamped with the current time
    pub fn new(samples: Vec<i16>, sample_rate: u32, sequence: u64) -> Self {
        Self {
            samples,
            sample_rate,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Wrap the frame for sharing between consumers
    pub fn shared(self) -> SharedFrame {
        Arc::new(self)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Monotonically increasing capture sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Duration of this frame in microseconds
    pub fn duration_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1_000_000) / self.sample_rate as u64
    }

    /// Samples as little-endian PCM16 bytes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        pcm16_to_le_bytes(&self.samples)
    }
}

/// Convert PCM16 samples to little-endian bytes
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Convert little-endian bytes to PCM16 samples.
///
/// A trailing odd byte is ignored.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration() {
        // 256 samples at 16kHz = 16ms
        let frame = AudioFrame::new(vec![0i16; 256], 16000, 0);
        assert_eq!(frame.duration_us(), 16_000);

        // 250 samples at 16kHz = 15.625ms
        let frame = AudioFrame::new(vec![0i16; 250], 16000, 0);
        assert_eq!(frame.duration_us(), 15_625);

        let frame = AudioFrame::new(vec![0i16; 256], 0, 0);
        assert_eq!(frame.duration_us(), 0);
    }

    #[test]
    fn test_le_byte_conversion() {
        let bytes = pcm16_to_le_bytes(&[0x1234, -2]);
        // Little-endian: 0x1234 -> [0x34, 0x12], -2 -> [0xFE, 0xFF]
        assert_eq!(bytes, vec![0x34, 0x12, 0xFE, 0xFF]);
        assert_eq!(pcm16_from_le_bytes(&bytes), vec![0x1234, -2]);
    }

    #[test]
    fn test_odd_trailing_byte_ignored() {
        assert_eq!(pcm16_from_le_bytes(&[0x01, 0x00, 0x07]), vec![1]);
    }
}
