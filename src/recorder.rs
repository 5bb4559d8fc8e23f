//! Single-utterance recording with cpal.
//!
//! Unlike the live session, the wake-word listener opens the microphone for
//! one utterance at a time and releases it between cycles. Recording stops
//! on trailing silence or when the utterance reaches its maximum length.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SilenceConfig;
use crate::voice::capture::InputHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Silence auto-stop, clocked by samples seen rather than wall time.
#[derive(Debug)]
pub struct SilenceDetector {
    sample_rate: f64,
    threshold: f32,
    silence_duration: f64,
    min_speech_duration: f64,
    max_duration: f64,
    elapsed: f64,
    silent_for: f64,
    heard_speech: bool,
}

impl SilenceDetector {
    pub fn new(sample_rate: u32, silence: &SilenceConfig, max_duration: f64) -> Self {
        Self {
            sample_rate: f64::from(sample_rate.max(1)),
            threshold: silence.threshold,
            silence_duration: silence.duration,
            min_speech_duration: silence.min_speech_duration,
            max_duration,
            elapsed: 0.0,
            silent_for: 0.0,
            heard_speech: false,
        }
    }

    /// Feed one block; returns true when recording should stop.
    pub fn feed(&mut self, block: &[f32]) -> bool {
        let block_secs = block.len() as f64 / self.sample_rate;
        self.elapsed += block_secs;

        if self.elapsed >= self.max_duration {
            debug!("Max utterance duration reached ({}s)", self.max_duration);
            return true;
        }

        if rms_energy(block) < self.threshold {
            self.silent_for += block_secs;
        } else {
            self.silent_for = 0.0;
            self.heard_speech = true;
        }

        // Don't check silence until minimum speech duration
        if self.elapsed < self.min_speech_duration || !self.heard_speech {
            return false;
        }
        self.silent_for >= self.silence_duration
    }
}

struct Shared {
    buffer: Vec<f32>,
    detector: SilenceDetector,
    done: bool,
}

pub struct UtteranceRecorder {
    sample_rate: u32,
    max_duration: f64,
    silence: SilenceConfig,
}

impl UtteranceRecorder {
    pub fn new(sample_rate: u32, max_duration: f64, silence: SilenceConfig) -> Self {
        Self {
            sample_rate,
            max_duration,
            silence,
        }
    }

    /// Open the microphone, record one utterance, release the microphone.
    pub async fn record(&self) -> Result<Vec<f32>, String> {
        let max_samples = (self.max_duration * f64::from(self.sample_rate)) as usize;
        let shared = Arc::new(Mutex::new(Shared {
            buffer: Vec::with_capacity(max_samples),
            detector: SilenceDetector::new(self.sample_rate, &self.silence, self.max_duration),
            done: false,
        }));

        let callback_shared = Arc::clone(&shared);
        let sample_rate = self.sample_rate;
        let open = move || {
            InputHandle::open(sample_rate, move |data| {
                let mut inner = callback_shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if inner.done {
                    return;
                }
                let remaining = max_samples.saturating_sub(inner.buffer.len());
                inner.buffer.extend_from_slice(&data[..data.len().min(remaining)]);
                if inner.detector.feed(data) || inner.buffer.len() >= max_samples {
                    inner.done = true;
                }
            })
        };
        // The capture thread reports readiness over a blocking channel
        let input = tokio::task::spawn_blocking(open)
            .await
            .map_err(|e| format!("Capture task failed: {e}"))??;

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if shared.lock().unwrap_or_else(PoisonError::into_inner).done {
                break;
            }
        }
        let _ = tokio::task::spawn_blocking(move || drop(input)).await;

        let samples = std::mem::take(&mut shared.lock().unwrap_or_else(PoisonError::into_inner).buffer);
        info!(
            "Utterance recorded: {:.1}s ({} samples)",
            samples.len() as f64 / f64::from(self.sample_rate),
            samples.len()
        );
        Ok(samples)
    }

    /// Check if audio data is silent.
    pub fn is_silent(samples: &[f32], threshold: f32) -> bool {
        let rms = rms_energy(samples);
        debug!("Audio RMS energy: {rms:.4} (threshold: {threshold})");
        rms < threshold
    }
}

/// Calculate RMS energy of audio samples.
fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
