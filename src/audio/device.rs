//! Blocking audio device seams
//!
//! The engine drives devices from dedicated blocking threads: capture blocks on
//! `read_chunk`, playback blocks on `write_chunk`. Both sides speak PCM16 mono
//! at the rate they report; rate conversion to and from the hardware happens
//! inside the implementation.

use crate::error::DeviceError;

/// A source of fixed-size PCM16 mono chunks
pub trait InputDevice: Send + 'static {
    /// Block until `buf` has been completely filled
    fn read_chunk(&mut self, buf: &mut [i16]) -> Result<(), DeviceError>;

    /// Sample rate of the chunks returned by `read_chunk`
    fn sample_rate(&self) -> u32;

    /// Total samples lost because the reader fell behind the hardware
    fn overruns(&self) -> u64 {
        0
    }
}

/// A sink for PCM16 mono chunks
pub trait OutputDevice: Send + 'static {
    /// Block until `samples` have been accepted by the device.
    ///
    /// Must accept silence without error.
    fn write_chunk(&mut self, samples: &[i16]) -> Result<(), DeviceError>;

    /// Drop anything the device has buffered but not yet played
    fn discard(&mut self) {}

    /// Sample rate expected by `write_chunk`
    fn sample_rate(&self) -> u32;
}

impl<T: InputDevice + ?Sized> InputDevice for Box<T> {
    fn read_chunk(&mut self, buf: &mut [i16]) -> Result<(), DeviceError> {
        (**self).read_chunk(buf)
    }

    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn overruns(&self) -> u64 {
        (**self).overruns()
    }
}

impl<T: OutputDevice + ?Sized> OutputDevice for Box<T> {
    fn write_chunk(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        (**self).write_chunk(samples)
    }

    fn discard(&mut self) {
        (**self).discard()
    }

    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }
}
