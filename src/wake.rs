//! Wake-word listener.
//!
//! Runs short local recognition cycles (record one utterance, transcribe
//! with Whisper) and requests a voice session when a wake phrase is heard.
//! Suspended while a voice or focus session is active.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::WakeWordConfig;
use crate::recorder::UtteranceRecorder;
use crate::transcriber::WhisperTranscriber;

/// How long to wait for the requested session to show up as active.
const SESSION_START_GRACE: Duration = Duration::from_secs(5);

/// What else is using the microphone or the user's attention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub voice_active: bool,
    pub focus_active: bool,
}

impl Activity {
    pub fn is_idle(&self) -> bool {
        !self.voice_active && !self.focus_active
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case-insensitive substring match against any phrase, ignoring
/// punctuation ("Oi, Alba!" matches "oi alba").
pub fn matches_wake_phrase(transcript: &str, phrases: &[String]) -> bool {
    let heard = normalize(transcript);
    !heard.is_empty()
        && phrases
            .iter()
            .map(|p| normalize(p))
            .any(|p| !p.is_empty() && heard.contains(&p))
}

/// One recognition cycle: returns the transcript of a single utterance.
pub trait Recognizer: Send + Sync {
    fn listen(&self) -> impl Future<Output = Result<String, String>> + Send;
}

pub struct WhisperRecognizer {
    recorder: UtteranceRecorder,
    transcriber: WhisperTranscriber,
    silence_threshold: f32,
}

impl WhisperRecognizer {
    pub fn new(config: &WakeWordConfig, transcriber: WhisperTranscriber) -> Self {
        Self {
            recorder: UtteranceRecorder::new(
                config.sample_rate,
                config.max_utterance_secs,
                config.silence.clone(),
            ),
            transcriber,
            silence_threshold: config.silence.threshold,
        }
    }
}

impl Recognizer for WhisperRecognizer {
    async fn listen(&self) -> Result<String, String> {
        let samples = self.recorder.record().await?;
        if samples.is_empty() || UtteranceRecorder::is_silent(&samples, self.silence_threshold) {
            return Ok(String::new());
        }
        let transcriber = self.transcriber.clone();
        tokio::task::spawn_blocking(move || transcriber.transcribe(&samples))
            .await
            .map_err(|e| format!("Transcription task failed: {e}"))?
    }
}

/// Wait until `pred` holds for the current activity. False if the sender
/// is gone.
async fn wait_until(rx: &mut watch::Receiver<Activity>, pred: impl Fn(&Activity) -> bool) -> bool {
    loop {
        let ready = pred(&rx.borrow_and_update());
        if ready {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

pub struct WakeListener<R> {
    recognizer: R,
    phrases: Vec<String>,
    restart_delay: Duration,
    failure_delay: Duration,
    activity: watch::Receiver<Activity>,
    listening: watch::Sender<bool>,
    on_wake: Arc<dyn Fn() + Send + Sync>,
}

impl<R: Recognizer> WakeListener<R> {
    pub fn new(
        config: &WakeWordConfig,
        recognizer: R,
        activity: watch::Receiver<Activity>,
        listening: watch::Sender<bool>,
        on_wake: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            recognizer,
            phrases: config.phrases.clone(),
            restart_delay: Duration::from_millis(config.restart_delay_ms),
            failure_delay: Duration::from_millis(config.failure_delay_ms),
            activity,
            listening,
            on_wake,
        }
    }

    pub async fn run(mut self) {
        info!("Wake-word listener running ({:?})", self.phrases);
        loop {
            if !wait_until(&mut self.activity, Activity::is_idle).await {
                return;
            }

            self.listening.send_replace(true);
            let outcome = tokio::select! {
                result = self.recognizer.listen() => Some(result),
                _ = wait_until(&mut self.activity, |a| !a.is_idle()) => None,
            };
            self.listening.send_replace(false);

            let delay = match outcome {
                None => {
                    debug!("Wake-word listener suspended");
                    continue;
                }
                Some(Ok(text)) if matches_wake_phrase(&text, &self.phrases) => {
                    info!("Wake phrase heard: \"{text}\"");
                    (self.on_wake)();
                    let started = wait_until(&mut self.activity, |a| !a.is_idle());
                    if tokio::time::timeout(SESSION_START_GRACE, started).await.is_err() {
                        warn!("Voice session did not start after wake phrase");
                    }
                    self.restart_delay
                }
                Some(Ok(text)) => {
                    if !text.is_empty() {
                        debug!("Heard \"{text}\", no wake phrase");
                    }
                    self.restart_delay
                }
                Some(Err(e)) => {
                    warn!("Wake-word cycle failed: {e}");
                    self.failure_delay
                }
            };
            tokio::time::sleep(delay).await;
        }
    }
}
