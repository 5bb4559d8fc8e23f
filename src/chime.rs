//! Audible stand-in for device vibration.
//!
//! A vibration pattern `[on, off, on, ...]` in milliseconds becomes
//! alternating 880 Hz tone and silence segments.

use std::time::Duration;

use tracing::{debug, warn};

use crate::model::Task;
use crate::scheduler::AlarmChannel;
use crate::voice::playback::AudioOutput;

const SAMPLE_RATE: u32 = 24000;
const TONE_HZ: f32 = 880.0;
const AMPLITUDE: f32 = 0.1;

/// Render `pattern` as mono samples at `sample_rate`.
pub fn render_pattern(pattern: &[u32], sample_rate: u32) -> Vec<f32> {
    let mut samples = Vec::new();
    for (i, &ms) in pattern.iter().enumerate() {
        let n = (u64::from(ms) * u64::from(sample_rate) / 1000) as usize;
        if i % 2 == 0 {
            let step = std::f32::consts::TAU * TONE_HZ / sample_rate as f32;
            samples.extend((0..n).map(|k| (step * k as f32).sin() * AMPLITUDE));
        } else {
            samples.resize(samples.len() + n, 0.0);
        }
    }
    samples
}

pub struct ChimeChannel {
    pattern: Vec<u32>,
}

impl ChimeChannel {
    pub fn new(pattern: Vec<u32>) -> Self {
        Self { pattern }
    }
}

impl AlarmChannel for ChimeChannel {
    fn name(&self) -> &'static str {
        "chime"
    }

    fn fire(&self, _task: &Task) -> Result<(), String> {
        let samples = render_pattern(&self.pattern, SAMPLE_RATE);
        if samples.is_empty() {
            return Ok(());
        }
        std::thread::Builder::new()
            .name("chime".into())
            .spawn(move || {
                let output = match AudioOutput::open() {
                    Ok(output) => output,
                    Err(e) => {
                        warn!("Chime unavailable: {e}");
                        return;
                    }
                };
                output.append(samples, SAMPLE_RATE);
                while !output.is_empty() {
                    std::thread::sleep(Duration::from_millis(50));
                }
                debug!("Chime finished");
            })
            .map(|_| ())
            .map_err(|e| format!("Failed to spawn chime thread: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_length_matches_durations() {
        let samples = render_pattern(&[500, 200, 500], 1000);
        assert_eq!(samples.len(), 1200);
    }

    #[test]
    fn test_gaps_are_silent_and_tone_is_quiet() {
        let samples = render_pattern(&[100, 100], 8000);
        let (tone, gap) = samples.split_at(800);
        assert!(gap.iter().all(|&s| s == 0.0));
        assert!(tone.iter().any(|&s| s != 0.0));
        assert!(tone.iter().all(|s| s.abs() <= AMPLITUDE));
    }

    #[test]
    fn test_empty_pattern_is_empty() {
        assert!(render_pattern(&[], SAMPLE_RATE).is_empty());
    }
}
