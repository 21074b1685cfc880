//! Audio primitives for the duplex engine
//!
//! Frames, the bounded queue every stage buffers through, the capture fan-out,
//! rate conversion, and the blocking device seams with their CPAL and mock
//! implementations.

pub mod cpal_device;
pub mod device;
pub mod fanout;
pub mod frame;
pub mod mock;
pub mod queue;
pub mod resample;

pub use cpal_device::{list_devices, CpalInput, CpalOutput, DeviceInfo};
pub use device::{InputDevice, OutputDevice};
pub use fanout::{Delivery, FanOut, FrameSubscriber};
pub use frame::{pcm16_from_le_bytes, pcm16_to_le_bytes, AudioFrame, SharedFrame};
pub use mock::{MockInput, MockInputControl, MockOutput, MockOutputControl};
pub use queue::{FrameQueue, OverflowPolicy, PushOutcome};
pub use resample::{mix_to_mono, RateConverter, ResampleError};
