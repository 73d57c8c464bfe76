//! Short-window energy levels for the capture and render paths

use serde::{Deserialize, Serialize};

/// Lowest level that still registers, in dBFS
const FLOOR_DB: f32 = -60.0;

/// Input and output levels, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioLevels {
    pub input: f32,
    pub output: f32,
}

impl AudioLevels {
    pub const SILENT: AudioLevels = AudioLevels {
        input: 0.0,
        output: 0.0,
    };
}

/// Root-mean-square of a window with its DC offset removed
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
    let sum_squares: f32 = samples.iter().map(|&s| (s - mean) * (s - mean)).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Map a window's energy onto [0, 1] over a 60 dB range
pub fn window_level(samples: &[f32]) -> f32 {
    let rms = calculate_rms(samples);
    if rms <= 0.0 || rms.is_nan() {
        return 0.0;
    }

    let db = 20.0 * rms.log10();
    ((db - FLOOR_DB) / -FLOOR_DB).clamp(0.0, 1.0)
}

/// Output of one meter tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    /// Always-current levels
    pub live: AudioLevels,
    /// Set on every `publish_every`th tick
    pub published: Option<AudioLevels>,
}

/// Turns analysis windows into levels and throttles what gets published
#[derive(Debug)]
pub struct LevelMeter {
    publish_every: u32,
    ticks: u32,
}

impl LevelMeter {
    pub fn new(publish_every: u32) -> Self {
        Self {
            publish_every: publish_every.max(1),
            ticks: 0,
        }
    }

    pub fn tick(&mut self, input_window: &[f32], output_window: &[f32], muted: bool) -> MeterReading {
        let live = AudioLevels {
            input: if muted { 0.0 } else { window_level(input_window) },
            output: window_level(output_window),
        };

        self.ticks += 1;
        let published = if self.ticks >= self.publish_every {
            self.ticks = 0;
            Some(live)
        } else {
            None
        };

        MeterReading { live, published }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: f32) -> Vec<f32> {
        (0..512)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16000.0).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_silence_is_zero() {
        assert_eq!(window_level(&[]), 0.0);
        assert_eq!(window_level(&[0.0; 256]), 0.0);
        // Pure DC carries no signal energy
        assert_eq!(window_level(&[0.3; 256]), 0.0);
    }

    #[test]
    fn test_levels_are_bounded_and_monotonic() {
        let quiet = window_level(&tone(0.01));
        let loud = window_level(&tone(0.5));
        let clipped = window_level(&tone(4.0));

        assert!(quiet > 0.0 && quiet < loud);
        assert!(loud <= 1.0);
        assert_eq!(clipped, 1.0);
    }

    #[test]
    fn test_publish_throttle() {
        let mut meter = LevelMeter::new(5);
        let signal = tone(0.5);

        let published: Vec<bool> = (0..10)
            .map(|_| meter.tick(&signal, &signal, false).published.is_some())
            .collect();
        assert_eq!(
            published,
            vec![false, false, false, false, true, false, false, false, false, true]
        );
    }

    #[test]
    fn test_mute_zeroes_input_only() {
        let mut meter = LevelMeter::new(1);
        let signal = tone(0.5);

        let reading = meter.tick(&signal, &signal, true);
        assert_eq!(reading.live.input, 0.0);
        assert!(reading.live.output > 0.0);
        assert_eq!(reading.published, Some(reading.live));
    }
}
