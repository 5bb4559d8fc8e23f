//! Spoken alerts through the Gemini TTS endpoint.
//!
//! Text → `generateContent` with an AUDIO response modality → base64 PCM16
//! at 24 kHz → rodio. Utterances are serialized and skipped entirely while
//! a voice session owns the speaker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::SpeechConfig;
use crate::model::Task;
use crate::scheduler::AlarmChannel;
use crate::voice::codec::decode_chunk;
use crate::voice::playback::AudioOutput;
use crate::wake::Activity;

/// Fire-and-forget speech.
pub trait Announce: Send + Sync {
    fn announce(&self, text: String);
}

pub fn alarm_phrase(title: &str) -> String {
    format!("Atenção! Lembrete da Alba: {title}")
}

pub fn task_saved_phrase(title: &str) -> String {
    format!("Tarefa salva: {title}")
}

pub fn transaction_phrase(amount: f64) -> String {
    format!("Lançamento de {amount} reais registrado.")
}

pub const FOCUS_ENDED_PHRASE: &str = "Foco encerrado.";

pub fn tts_request(text: &str, voice_name: &str) -> Value {
    json!({
        "contents": [{ "parts": [{ "text": text }] }],
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": voice_name }
                }
            }
        }
    })
}

/// Base64 audio of the first candidate part.
pub fn extract_audio(response: &Value) -> Result<&str, String> {
    response
        .pointer("/candidates/0/content/parts/0/inlineData/data")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            let reason = response
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("no audio in response");
            format!("TTS returned no audio: {reason}")
        })
}

#[derive(Clone)]
pub struct Speaker {
    client: Client,
    config: SpeechConfig,
    api_key: String,
    activity: watch::Receiver<Activity>,
    speak_lock: Arc<Mutex<()>>,
}

impl Speaker {
    pub fn new(config: SpeechConfig, api_key: String, activity: watch::Receiver<Activity>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to configure HTTP client ({e}), using defaults");
                Client::new()
            });
        Self {
            client,
            config,
            api_key,
            activity,
            speak_lock: Arc::new(Mutex::new(())),
        }
    }

    fn suppressed(&self) -> bool {
        self.activity.borrow().voice_active
    }

    pub async fn speak(&self, text: &str) -> Result<(), String> {
        if !self.config.enabled {
            return Ok(());
        }
        if self.api_key.is_empty() {
            return Err("No API key configured for speech".into());
        }
        let _guard = self.speak_lock.lock().await;
        if self.suppressed() {
            debug!("Voice session active, not speaking \"{text}\"");
            return Ok(());
        }

        let t0 = Instant::now();
        let samples = self.synthesize(text).await?;
        info!(
            "Synthesized \"{text}\" ({:.1}s audio) in {}ms",
            samples.len() as f64 / f64::from(self.config.sample_rate),
            t0.elapsed().as_millis()
        );

        // The session may have started while we were waiting on the network
        if self.suppressed() {
            return Ok(());
        }
        let output = tokio::task::spawn_blocking(AudioOutput::open)
            .await
            .map_err(|e| format!("Audio output task failed: {e}"))??;
        output.append(samples, self.config.sample_rate);
        output.drain().await;
        // Closing joins the output thread
        let _ = tokio::task::spawn_blocking(move || drop(output)).await;
        Ok(())
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<f32>, String> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.config.endpoint, self.config.model, self.api_key
        );
        let resp = self
            .client
            .post(&url)
            .json(&tts_request(text, &self.config.voice_name))
            .send()
            .await
            .map_err(|e| format!("TTS request failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(format!("TTS returned status {status}: {}", detail.trim()));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| format!("Failed to parse TTS response: {e}"))?;
        let samples = decode_chunk(extract_audio(&body)?);
        if samples.is_empty() {
            return Err("TTS audio was empty".into());
        }
        Ok(samples)
    }
}

impl Announce for Speaker {
    fn announce(&self, text: String) {
        let speaker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = speaker.speak(&text).await {
                warn!("Spoken alert failed: {e}");
            }
        });
    }
}

/// Alarm channel that reads the task title aloud.
pub struct SpokenAlertChannel {
    speaker: Arc<dyn Announce>,
}

impl SpokenAlertChannel {
    pub fn new(speaker: Arc<dyn Announce>) -> Self {
        Self { speaker }
    }
}

impl AlarmChannel for SpokenAlertChannel {
    fn name(&self) -> &'static str {
        "speech"
    }

    fn fire(&self, task: &Task) -> Result<(), String> {
        self.speaker.announce(alarm_phrase(&task.title));
        Ok(())
    }
}
