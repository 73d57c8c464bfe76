use crate::{RealtalkError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Frames per resampler call
const CHUNK_SIZE: usize = 1024;

/// Streaming mono sample-rate converter.
///
/// Input is buffered until a whole chunk is available, so no padding is
/// inserted between calls and the output of consecutive slices is one
/// continuous signal.
pub struct AudioResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    pending: Vec<f32>,
}

impl AudioResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(RealtalkError::ConfigError(
                "Sample rates must be greater than 0".into(),
            ));
        }

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            2.0,
            params,
            CHUNK_SIZE,
            1,
        )
        .map_err(|e| RealtalkError::AudioDeviceError(format!("Failed to create resampler: {}", e)))?;

        debug!("Created resampler: {} Hz -> {} Hz", input_rate, output_rate);

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
        })
    }

    /// Feed a slice of a continuous stream, returning whatever output is ready
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let processed = self
                .resampler
                .process(&[chunk], None)
                .map_err(|e| RealtalkError::AudioDeviceError(format!("Resampling failed: {}", e)))?;
            output.extend_from_slice(&processed[0]);
        }

        Ok(output)
    }

    /// Input frames still needed before the next chunk is converted
    pub fn input_frames_next(&self) -> usize {
        self.resampler
            .input_frames_next()
            .saturating_sub(self.pending.len())
            .max(1)
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Drop buffered input and filter state
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }
}
