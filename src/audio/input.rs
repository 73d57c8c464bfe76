use crate::audio::buffer::AudioRingBuffer;
use crate::audio::device::{AudioConfig, CaptureSink};
use crate::audio::resampler::AudioResampler;
use crate::{RealtalkError, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Average interleaved frames down to mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Turns raw device callbacks into fixed-size blocks at the capture rate.
///
/// Every converted sample reaches the level tap; only complete blocks reach
/// the capture sink, and only while one is installed.
pub struct CaptureProcessor {
    channels: usize,
    resampler: Option<AudioResampler>,
    block_size: usize,
    block: Vec<f32>,
    tap: AudioRingBuffer,
    sink: Arc<Mutex<Option<CaptureSink>>>,
}

impl CaptureProcessor {
    pub fn new(
        device_rate: u32,
        channels: u16,
        config: &AudioConfig,
        tap: AudioRingBuffer,
        sink: Arc<Mutex<Option<CaptureSink>>>,
    ) -> Result<Self> {
        let resampler = if device_rate != config.input_sample_rate {
            Some(AudioResampler::new(device_rate, config.input_sample_rate)?)
        } else {
            None
        };
        let block_size = config.capture_block_size.max(1);

        Ok(Self {
            channels: channels.max(1) as usize,
            resampler,
            block_size,
            block: Vec::with_capacity(block_size),
            tap,
            sink,
        })
    }

    pub fn process(&mut self, interleaved: &[f32]) {
        let mono = downmix(interleaved, self.channels);
        let samples = match self.resampler.as_mut() {
            Some(resampler) => match resampler.process(&mono) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("Dropping capture data: {}", e);
                    return;
                }
            },
            None => mono,
        };

        self.tap.write(&samples);

        for sample in samples {
            self.block.push(sample);
            if self.block.len() == self.block_size {
                if let Some(sink) = self.sink.lock().as_mut() {
                    sink(&self.block);
                }
                self.block.clear();
            }
        }
    }
}

/// Build and start an input stream on `device` forwarding raw interleaved
/// callbacks to `raw_tx`. Returns the stream and its config.
pub fn start_input_stream(device: &Device, raw_tx: Sender<Vec<f32>>) -> Result<(Stream, StreamConfig)> {
    info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let config: StreamConfig = device
        .default_input_config()
        .map_err(|e| RealtalkError::AudioDeviceError(format!("Failed to get input config: {}", e)))?
        .into();

    let err_fn = |err| {
        error!("Audio input stream error: {}", err);
    };

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Err(e) = raw_tx.try_send(data.to_vec()) {
                    debug!("Failed to queue capture data: {}", e);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                RealtalkError::PermissionDenied("Input device is not available".into())
            }
            other => RealtalkError::AudioDeviceError(format!("Failed to build input stream: {}", other)),
        })?;

    stream
        .play()
        .map_err(|e| RealtalkError::AudioDeviceError(format!("Failed to start input stream: {}", e)))?;

    info!(
        "Started audio capture ({} Hz, {} channels)",
        config.sample_rate.0, config.channels
    );
    Ok((stream, config))
}
