//! alba-rs: voice-driven agenda, alarm and expense assistant for Linux.

mod api;
mod bus;
mod chime;
mod config;
mod focus;
mod model;
mod notifier;
mod recorder;
mod scheduler;
mod service;
mod speech;
mod state;
mod store;
mod transcriber;
mod voice;
mod wake;

use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "alba-rs", about = "Personal agenda and finance assistant")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for persisted tasks and transactions
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Do not listen for the wake word
    #[arg(long)]
    no_wake_word: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy websocket/http internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,tungstenite=info,tokio_tungstenite=info,hyper=info,reqwest=info")
    } else {
        EnvFilter::new("info,whisper_rs=warn,tungstenite=warn,tokio_tungstenite=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("alba-rs starting");

    let mut config = config::Config::load(args.config.as_deref());
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.display().to_string();
    }
    if args.no_wake_word {
        config.wake_word.enabled = false;
    }
    if config.voice.api_key.is_empty() {
        warn!("No Gemini API key configured; voice sessions and spoken alerts will fail");
    }

    let data_dir = config.storage.resolve_dir();
    let store = store::Store::open(&data_dir)?;
    info!("Data directory: {}", data_dir.display());
    let state = state::AppState::new(store);

    // Load Whisper model for the wake word (blocking, takes a few seconds)
    let transcriber = if config.wake_word.enabled {
        info!("Loading Whisper model...");
        let model = config.wake_word.model.clone();
        let language = config.wake_word.language.clone();
        match tokio::task::spawn_blocking(move || {
            transcriber::WhisperTranscriber::load(&model, &language)
        })
        .await?
        {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("Failed to load Whisper model: {e}");
                info!("Wake word disabled, continuing without it");
                None
            }
        }
    } else {
        None
    };

    service::AlbaService::new(config, state, transcriber)
        .run()
        .await
}
