//! Device adapter boundary: microphone capture, scheduled rendering and the
//! render clock.

use crate::audio::buffer::AudioRingBuffer;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies one scheduled playback buffer
pub type PlaybackToken = u64;

/// Receives fixed-size mono capture blocks at the configured input rate.
///
/// Runs on the capture thread; implementations must not block.
pub type CaptureSink = Box<dyn FnMut(&[f32]) + Send>;

/// Audio configuration shared by every device backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of the blocks delivered to the capture sink
    pub input_sample_rate: u32,

    /// Sample rate of inbound synthesized audio
    pub output_sample_rate: u32,

    /// Samples per capture block
    pub capture_block_size: usize,

    /// Samples kept per path for level analysis
    pub analyser_window: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            capture_block_size: 4096,
            analyser_window: 512,
        }
    }
}

/// Most recent samples of each audio path, for level metering
#[derive(Clone)]
pub struct LevelTaps {
    pub input: AudioRingBuffer,
    pub output: AudioRingBuffer,
}

impl LevelTaps {
    pub fn new(window: usize) -> Self {
        Self {
            input: AudioRingBuffer::new(window),
            output: AudioRingBuffer::new(window),
        }
    }
}

/// Live capture and render resources for one provisioning attempt
pub trait AudioDevice: Send + Sync {
    /// Monotonic render clock in seconds
    fn clock(&self) -> f64;

    /// Install or remove the capture callback
    fn set_capture_sink(&self, sink: Option<CaptureSink>);

    /// Play `samples` (at the output sample rate) starting at `start_at` on
    /// the render clock. Completion is reported with `token`.
    ///
    /// Returns the start actually used, which is later than `start_at` when
    /// the clock has already passed it.
    fn schedule(&self, token: PlaybackToken, samples: Arc<[f32]>, start_at: f64) -> f64;

    /// Cancel a scheduled or playing buffer without reporting completion
    fn stop(&self, token: PlaybackToken);

    fn taps(&self) -> LevelTaps;

    /// Release the hardware. Safe to call more than once.
    fn close(&self);
}

/// A freshly acquired device plus its playback-completion stream
pub struct AcquiredDevice {
    pub device: Arc<dyn AudioDevice>,
    pub completions: mpsc::UnboundedReceiver<PlaybackToken>,
}

/// Acquires capture and render resources.
///
/// Acquisition may wait on a permission prompt. Failures are fatal to the
/// session and never retried.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn acquire(&self, config: &AudioConfig) -> Result<AcquiredDevice>;
}
