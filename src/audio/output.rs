use crate::audio::buffer::AudioRingBuffer;
use crate::audio::device::PlaybackToken;
use crate::audio::resampler::AudioResampler;
use crate::{RealtalkError, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

struct Voice {
    token: PlaybackToken,
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixes scheduled mono buffers by absolute frame position at the rate they
/// were scheduled in. The frame counter is the render clock.
pub struct RenderMixer {
    rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
    mix: Vec<f32>,
    completions: UnboundedSender<PlaybackToken>,
    tap: AudioRingBuffer,
}

impl RenderMixer {
    pub fn new(rate: u32, completions: UnboundedSender<PlaybackToken>, tap: AudioRingBuffer) -> Self {
        Self {
            rate: rate.max(1),
            frames_rendered: 0,
            voices: Vec::new(),
            mix: Vec::new(),
            completions,
            tap,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Seconds of audio rendered so far
    pub fn clock(&self) -> f64 {
        self.frames_rendered as f64 / self.rate as f64
    }

    /// Schedule samples at `start_at` seconds and return the start actually
    /// used. A start in the past begins at the next rendered frame.
    pub fn schedule(&mut self, token: PlaybackToken, samples: Arc<[f32]>, start_at: f64) -> f64 {
        let requested = (start_at.max(0.0) * self.rate as f64).round() as u64;
        let start_frame = requested.max(self.frames_rendered);
        self.voices.push(Voice {
            token,
            start_frame,
            samples,
        });

        if start_frame == requested {
            start_at
        } else {
            start_frame as f64 / self.rate as f64
        }
    }

    pub fn stop(&mut self, token: PlaybackToken) {
        self.voices.retain(|v| v.token != token);
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    pub fn pending(&self) -> usize {
        self.voices.len()
    }

    /// Mix the next `frames` mono frames and advance the clock
    pub fn mix(&mut self, frames: usize) -> &[f32] {
        let base = self.frames_rendered;
        let window_end = base + frames as u64;

        self.mix.clear();
        self.mix.resize(frames, 0.0);

        for voice in &self.voices {
            let from = voice.start_frame.max(base);
            let to = voice.end_frame().min(window_end);
            for frame in from..to {
                self.mix[(frame - base) as usize] += voice.samples[(frame - voice.start_frame) as usize];
            }
        }
        for sample in self.mix.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.tap.write(&self.mix);
        self.frames_rendered = window_end;

        let completions = &self.completions;
        self.voices.retain(|voice| {
            if voice.end_frame() <= window_end {
                let _ = completions.send(voice.token);
                false
            } else {
                true
            }
        });

        &self.mix
    }

    /// Fill an interleaved output buffer and advance the clock
    pub fn render(&mut self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let mix = self.mix(data.len() / channels);
        for (frame, &sample) in data.chunks_mut(channels).zip(mix) {
            frame.fill(sample);
        }
    }
}

/// Feeds a device from the mixer, converting to the device rate when the
/// two differ.
///
/// The mixer output is resampled as one continuous stream, so buffers that
/// are contiguous on the mixer clock stay contiguous on the device. Owned by
/// the output callback.
pub struct RenderStage {
    mixer: Arc<Mutex<RenderMixer>>,
    resampler: Option<AudioResampler>,
    converted: VecDeque<f32>,
}

impl RenderStage {
    pub fn new(mixer: Arc<Mutex<RenderMixer>>, device_rate: u32) -> Result<Self> {
        let mixer_rate = mixer.lock().rate();
        let resampler = if device_rate == mixer_rate {
            None
        } else {
            info!("Resampling playback {} Hz -> {} Hz", mixer_rate, device_rate);
            Some(AudioResampler::new(mixer_rate, device_rate)?)
        };

        Ok(Self {
            mixer,
            resampler,
            converted: VecDeque::new(),
        })
    }

    pub fn render(&mut self, data: &mut [f32], channels: usize) {
        let Some(resampler) = self.resampler.as_mut() else {
            self.mixer.lock().render(data, channels);
            return;
        };

        let channels = channels.max(1);
        let frames = data.len() / channels;
        while self.converted.len() < frames {
            let needed = resampler.input_frames_next();
            let mixed = self.mixer.lock().mix(needed).to_vec();
            match resampler.process(&mixed) {
                Ok(output) => self.converted.extend(output),
                Err(e) => {
                    warn!("Playback resampling failed: {}", e);
                    break;
                }
            }
        }

        for frame in data.chunks_mut(channels) {
            frame.fill(self.converted.pop_front().unwrap_or(0.0));
        }
    }
}

/// Pick an f32 output config at `preferred_rate` when the device supports
/// it, otherwise the device default
pub fn select_output_config(device: &Device, preferred_rate: u32) -> Result<StreamConfig> {
    if let Ok(configs) = device.supported_output_configs() {
        for range in configs {
            if range.sample_format() == SampleFormat::F32
                && range.min_sample_rate().0 <= preferred_rate
                && range.max_sample_rate().0 >= preferred_rate
            {
                return Ok(range.with_sample_rate(cpal::SampleRate(preferred_rate)).config());
            }
        }
    }

    debug!("Output device does not support {} Hz, using its default", preferred_rate);
    device
        .default_output_config()
        .map(|c| c.config())
        .map_err(|e| RealtalkError::AudioDeviceError(format!("Failed to get output config: {}", e)))
}

/// Build and start an output stream rendering from `stage`
pub fn start_output_stream(
    device: &Device,
    config: &StreamConfig,
    mut stage: RenderStage,
) -> Result<Stream> {
    info!(
        "Using output device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let channels = config.channels as usize;

    let err_fn = |err| {
        error!("Audio output stream error: {}", err);
    };

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                stage.render(data, channels);
            },
            err_fn,
            None,
        )
        .map_err(|e| RealtalkError::AudioDeviceError(format!("Failed to build output stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| RealtalkError::AudioDeviceError(format!("Failed to start output stream: {}", e)))?;

    info!(
        "Started audio playback ({} Hz, {} channels)",
        config.sample_rate.0, config.channels
    );
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn mixer(rate: u32) -> (RenderMixer, mpsc::UnboundedReceiver<PlaybackToken>, AudioRingBuffer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tap = AudioRingBuffer::new(64);
        (RenderMixer::new(rate, tx, tap.clone()), rx, tap)
    }

    #[test]
    fn test_clock_advances_with_rendering() {
        let (mut mixer, _rx, _tap) = mixer(1000);
        let mut out = vec![0.0; 200];
        mixer.render(&mut out, 2);
        assert!((mixer.clock() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_back_to_back_buffers_without_gap() {
        let (mut mixer, mut rx, _tap) = mixer(10);
        mixer.schedule(1, vec![0.5; 3].into(), 0.0);
        mixer.schedule(2, vec![0.25; 3].into(), 0.3);

        let mut out = vec![0.0; 8];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.5, 0.5, 0.5, 0.25, 0.25, 0.25, 0.0, 0.0]);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(mixer.pending(), 0);
    }

    #[test]
    fn test_buffer_spanning_callbacks() {
        let (mut mixer, mut rx, tap) = mixer(10);
        mixer.schedule(7, vec![0.1, 0.2, 0.3, 0.4].into(), 0.2);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.1, 0.2]);
        assert!(rx.try_recv().is_err());

        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.3, 0.4, 0.0, 0.0]);
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert_eq!(tap.len(), 8);
    }

    #[test]
    fn test_stop_cancels_without_completion() {
        let (mut mixer, mut rx, _tap) = mixer(10);
        mixer.schedule(3, vec![1.0; 4].into(), 0.0);
        mixer.stop(3);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0; 4]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_past_start_plays_from_now() {
        let (mut mixer, _rx, _tap) = mixer(10);
        let mut out = vec![0.0; 5];
        mixer.render(&mut out, 1);

        let started = mixer.schedule(1, vec![0.5; 2].into(), 0.1);
        assert!((started - 0.5).abs() < 1e-9);
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_late_start_reported_so_next_buffer_follows() {
        let (mut mixer, _rx, _tap) = mixer(10);
        let mut out = vec![0.0; 3];
        mixer.render(&mut out, 1);

        // The clock moved past the requested start before scheduling
        let started = mixer.schedule(1, vec![0.5; 2].into(), 0.1);
        mixer.schedule(2, vec![0.25; 2].into(), started + 0.2);

        let mut out = vec![0.0; 5];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.5, 0.5, 0.25, 0.25, 0.0]);
    }

    #[test]
    fn test_stage_at_mixer_rate_passes_through() {
        let (mixer, _rx, _tap) = mixer(10);
        let mixer = Arc::new(Mutex::new(mixer));
        let mut stage = RenderStage::new(Arc::clone(&mixer), 10).unwrap();

        mixer.lock().schedule(1, vec![0.5; 2].into(), 0.0);
        let mut out = vec![0.0; 6];
        stage.render(&mut out, 2);
        assert_eq!(out, vec![0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_stage_resamples_across_buffer_boundaries() {
        let (mixer, mut rx, _tap) = mixer(24000);
        let mixer = Arc::new(Mutex::new(mixer));
        let mut stage = RenderStage::new(Arc::clone(&mixer), 48000).unwrap();

        // Two contiguous buffers of a constant level
        let first = mixer.lock().schedule(1, vec![0.5; 960].into(), 0.0);
        mixer.lock().schedule(2, vec![0.5; 960].into(), first + 960.0 / 24000.0);

        let mut rendered = Vec::new();
        let mut out = vec![0.0; 512];
        for _ in 0..8 {
            stage.render(&mut out, 1);
            rendered.extend_from_slice(&out);
        }

        // Past the filter edges, the joint between the buffers is seamless
        for (i, sample) in rendered[600..3400].iter().enumerate() {
            assert!((sample - 0.5).abs() < 0.05, "sample {} was {}", i + 600, sample);
        }
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
    }
}
