//! Configuration management for alba-rs.
//!
//! Loads config from YAML files in standard locations. Every section
//! falls back to defaults field by field, so a partial file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the persisted keys. Empty means the platform data dir.
    pub data_dir: String,
}

impl StorageConfig {
    pub fn resolve_dir(&self) -> PathBuf {
        if !self.data_dir.is_empty() {
            return PathBuf::from(&self.data_dir);
        }
        dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("alba")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    /// Trigger time for tasks due today without an explicit time ("HH:MM").
    pub default_time: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            default_time: "08:00".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub notifications: bool,
    pub chime: bool,
    pub spoken: bool,
    pub vibration_pattern: Vec<u32>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            notifications: true,
            chime: true,
            spoken: true,
            vibration_pattern: vec![500, 200, 500],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub enabled: bool,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub voice_name: String,
    pub system_prompt: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub input_gain: f32,
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_attempts: u32,
    pub default_task_time: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".into(),
            model: "models/gemini-2.5-flash-native-audio-preview-12-2025".into(),
            voice_name: "Kore".into(),
            system_prompt: "Você é Alba. Sua missão é gerenciar tarefas e finanças. \
                Importante: Ao adicionar tarefas, extraia sempre o horário mencionado. \
                Se o usuário não disser a hora, use \"08:00\" como padrão. \
                Responda de forma curta e prestativa."
                .into(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            frame_size: 2048,
            input_gain: 1.8,
            reconnect_backoff_ms: 2000,
            max_reconnect_attempts: 5,
            default_task_time: "08:00".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub voice_name: String,
    pub sample_rate: u32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://generativelanguage.googleapis.com/v1beta/models".into(),
            model: "gemini-2.5-flash-preview-tts".into(),
            voice_name: "Kore".into(),
            sample_rate: 24000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SilenceConfig {
    pub threshold: f32,
    pub duration: f64,
    pub min_speech_duration: f64,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            duration: 0.8,
            min_speech_duration: 0.4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WakeWordConfig {
    pub enabled: bool,
    pub phrases: Vec<String>,
    pub language: String,
    pub model: String,
    pub sample_rate: u32,
    pub max_utterance_secs: f64,
    pub restart_delay_ms: u64,
    pub failure_delay_ms: u64,
    pub silence: SilenceConfig,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            phrases: vec![
                "alba".into(),
                "ei alba".into(),
                "oi alba".into(),
                "ajuda alba".into(),
            ],
            language: "pt".into(),
            model: "base".into(),
            sample_rate: 16000,
            max_utterance_secs: 4.0,
            restart_delay_ms: 500,
            failure_delay_ms: 2000,
            silence: SilenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    pub default_minutes: u32,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self { default_minutes: 25 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub alerts: AlertConfig,
    pub voice: VoiceConfig,
    pub speech: SpeechConfig,
    pub wake_word: WakeWordConfig,
    pub focus: FocusConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/alba/config.yaml
    /// 3. /etc/alba/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/alba/config.yaml")),
                Some(PathBuf::from("/etc/alba/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let mut config = match resolved {
            None => {
                info!("No config file found, using defaults");
                Self::default()
            }
            Some(config_path) => match std::fs::read_to_string(&config_path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        info!("Loaded config from {}", config_path.display());
                        config
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
        };

        config.apply_env();
        config
    }

    pub fn parse(contents: &str) -> Result<Self, String> {
        serde_yml::from_str(contents).map_err(|e| e.to_string())
    }

    /// The API key is shared by the live session and the TTS endpoint.
    fn apply_env(&mut self) {
        if self.voice.api_key.is_empty() {
            if let Ok(key) = std::env::var("GEMINI_API_KEY") {
                self.voice.api_key = key;
            }
        }
    }
}
