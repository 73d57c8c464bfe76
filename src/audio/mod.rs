pub mod buffer;
pub mod codec;
pub mod device;
#[cfg(feature = "audio-io")]
pub mod hardware;
#[cfg(feature = "audio-io")]
pub mod input;
pub mod meter;
#[cfg(feature = "audio-io")]
pub mod output;
#[cfg(feature = "audio-io")]
pub mod resampler;
pub mod scheduler;

pub use buffer::AudioRingBuffer;
pub use codec::{decode_frame, encode_chunk, AudioFrame, EncodedChunk};
pub use device::{
    AcquiredDevice, AudioConfig, AudioDevice, CaptureSink, DeviceProvider, LevelTaps, PlaybackToken,
};
#[cfg(feature = "audio-io")]
pub use hardware::{CpalDevice, CpalDevices};
pub use meter::{AudioLevels, LevelMeter, MeterReading};
pub use scheduler::{Completion, PlaybackEntry, PlaybackScheduler};
