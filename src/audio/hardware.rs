//! `cpal`-backed device adapter.
//!
//! cpal streams are not `Send`, so each acquisition spawns an audio thread
//! that builds and owns both streams. The thread also runs the capture
//! processor, keeping capture resampling off the real-time callback. Playback
//! is mixed at the inbound rate and resampled as one stream in the output
//! callback. Closing the device signals the thread and joins it.

use crate::audio::device::{
    AcquiredDevice, AudioConfig, AudioDevice, CaptureSink, DeviceProvider, LevelTaps, PlaybackToken,
};
use crate::audio::input::{start_input_stream, CaptureProcessor};
use crate::audio::output::{select_output_config, start_output_stream, RenderMixer, RenderStage};
use crate::{RealtalkError, Result};
use async_trait::async_trait;
use cpal::traits::HostTrait;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Acquires the host's default input and output devices
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }

    /// List available input devices
    pub fn list_input_devices() -> Result<Vec<String>> {
        use cpal::traits::DeviceTrait;

        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| RealtalkError::AudioDeviceError(e.to_string()))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

#[async_trait]
impl DeviceProvider for CpalDevices {
    async fn acquire(&self, config: &AudioConfig) -> Result<AcquiredDevice> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let taps = LevelTaps::new(config.analyser_window);
        let sink: Arc<Mutex<Option<CaptureSink>>> = Arc::new(Mutex::new(None));

        let thread = {
            let config = config.clone();
            let taps = taps.clone();
            let sink = Arc::clone(&sink);
            std::thread::Builder::new()
                .name("realtalk-audio".into())
                .spawn(move || run_audio_thread(config, taps, sink, completion_tx, ready_tx, shutdown_rx))?
        };

        let mixer = match ready_rx.await {
            Ok(Ok(mixer)) => mixer,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(RealtalkError::AudioDeviceError(
                    "Audio thread exited during startup".into(),
                ));
            }
        };

        let device = CpalDevice {
            mixer,
            sink,
            taps,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        };

        Ok(AcquiredDevice {
            device: Arc::new(device),
            completions,
        })
    }
}

fn run_audio_thread(
    config: AudioConfig,
    taps: LevelTaps,
    sink: Arc<Mutex<Option<CaptureSink>>>,
    completion_tx: mpsc::UnboundedSender<PlaybackToken>,
    ready_tx: oneshot::Sender<Result<Arc<Mutex<RenderMixer>>>>,
    shutdown_rx: Receiver<()>,
) {
    let (raw_tx, raw_rx) = bounded(64);

    let started = (|| {
        let host = cpal::default_host();
        let input_device = host
            .default_input_device()
            .ok_or_else(|| RealtalkError::AudioDeviceError("No input device available".into()))?;
        let output_device = host
            .default_output_device()
            .ok_or_else(|| RealtalkError::AudioDeviceError("No output device available".into()))?;

        let (input_stream, input_config) = start_input_stream(&input_device, raw_tx)?;

        // The mixer runs at the inbound rate; the render stage converts for
        // devices that cannot open at it
        let output_config = select_output_config(&output_device, config.output_sample_rate)?;
        let mixer = Arc::new(Mutex::new(RenderMixer::new(
            config.output_sample_rate,
            completion_tx,
            taps.output.clone(),
        )));
        let stage = RenderStage::new(Arc::clone(&mixer), output_config.sample_rate.0)?;
        let output_stream = start_output_stream(&output_device, &output_config, stage)?;

        let processor = CaptureProcessor::new(
            input_config.sample_rate.0,
            input_config.channels,
            &config,
            taps.input.clone(),
            sink,
        )?;

        Ok::<_, RealtalkError>((input_stream, output_stream, mixer, processor))
    })();

    let (input_stream, output_stream, mixer, mut processor) = match started {
        Ok(parts) => parts,
        Err(e) => {
            error!("Failed to start audio devices: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if ready_tx.send(Ok(mixer)).is_err() {
        // Acquisition was abandoned before we came up
        return;
    }

    loop {
        select! {
            recv(raw_rx) -> chunk => match chunk {
                Ok(chunk) => processor.process(&chunk),
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => break,
        }
    }

    drop(input_stream);
    drop(output_stream);
    info!("Audio thread stopped");
}

/// Live cpal streams for one provisioning attempt
pub struct CpalDevice {
    mixer: Arc<Mutex<RenderMixer>>,
    sink: Arc<Mutex<Option<CaptureSink>>>,
    taps: LevelTaps,
    shutdown: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AudioDevice for CpalDevice {
    fn clock(&self) -> f64 {
        self.mixer.lock().clock()
    }

    fn set_capture_sink(&self, sink: Option<CaptureSink>) {
        *self.sink.lock() = sink;
    }

    fn schedule(&self, token: PlaybackToken, samples: Arc<[f32]>, start_at: f64) -> f64 {
        self.mixer.lock().schedule(token, samples, start_at)
    }

    fn stop(&self, token: PlaybackToken) {
        self.mixer.lock().stop(token);
    }

    fn taps(&self) -> LevelTaps {
        self.taps.clone()
    }

    fn close(&self) {
        *self.sink.lock() = None;
        self.mixer.lock().clear();

        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("Audio thread panicked");
            }
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        if let Ok(devices) = CpalDevices::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }

    #[tokio::test]
    async fn test_acquire_and_close() {
        // Only meaningful on machines with audio hardware
        if let Ok(acquired) = CpalDevices::new().acquire(&AudioConfig::default()).await {
            assert!(acquired.device.clock() >= 0.0);
            acquired.device.close();
            acquired.device.close();
        }
    }
}
