//! Local Whisper ASR for the wake-word listener (whisper-rs).
//!
//! The GGML model is loaded once at startup; each call transcribes one
//! short 16 kHz mono utterance. Audio never leaves the machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// WhisperContext is Send+Sync; states are created per call.
#[derive(Clone)]
pub struct WhisperTranscriber {
    ctx: Arc<WhisperContext>,
    language: String,
}

impl WhisperTranscriber {
    pub fn load(model: &str, language: &str) -> Result<Self, String> {
        let model_path = find_model(model)?;

        info!("Loading Whisper model from {}", model_path.display());
        let t0 = Instant::now();

        let path = model_path
            .to_str()
            .ok_or_else(|| format!("Model path is not UTF-8: {}", model_path.display()))?;
        let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| format!("Failed to load Whisper model: {e}"))?;

        info!("Whisper model loaded in {}ms", t0.elapsed().as_millis());

        Ok(Self {
            ctx: Arc::new(ctx),
            language: language.to_string(),
        })
    }

    /// Transcribe audio samples (f32, 16kHz, mono) to text.
    pub fn transcribe(&self, samples: &[f32]) -> Result<String, String> {
        let t0 = Instant::now();

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| format!("Failed to create whisper state: {e}"))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(self.language.as_str()));
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_single_segment(true);
        params.set_token_timestamps(false);

        state
            .full(params, samples)
            .map_err(|e| format!("Whisper inference failed: {e}"))?;

        let mut text = String::new();
        for i in 0..state.full_n_segments() {
            if let Some(segment) = state.get_segment(i) {
                if let Ok(segment_text) = segment.to_str_lossy() {
                    let trimmed = segment_text.trim();
                    if !trimmed.is_empty() {
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(trimmed);
                    }
                }
            }
        }

        debug!(
            "Transcribed {:.1}s audio in {}ms: \"{}\"",
            samples.len() as f64 / 16000.0,
            t0.elapsed().as_millis(),
            text
        );
        Ok(text)
    }
}

fn search_dirs() -> Vec<PathBuf> {
    [
        std::env::current_dir().ok(),
        dirs::home_dir().map(|h| h.join(".cache/whisper")),
        dirs::data_dir().map(|d| d.join("alba/models")),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// A direct file path, or `ggml-<name>.bin` in the search directories.
fn find_model(model_name: &str) -> Result<PathBuf, String> {
    let direct = PathBuf::from(model_name);
    if direct.exists() && direct.extension().is_some() {
        return Ok(direct);
    }

    let filename = format!("ggml-{}.bin", model_name.replace('/', "-"));
    let dirs = search_dirs();
    if let Some(path) = dirs.iter().map(|d| d.join(&filename)).find(|p| p.exists()) {
        return Ok(path);
    }

    Err(format!(
        "Whisper GGML model not found. Download with:\n  \
         wget https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-{model_name}.bin\n\
         Searched in: {dirs:?}"
    ))
}
