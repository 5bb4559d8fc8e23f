//! Service orchestration.
//!
//! Wires the shared state to its producers (scheduler, bus listener, voice
//! tools, API) and keeps the activity gate current: the wake-word listener
//! and spoken alerts both watch it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{start_api, ApiState};
use crate::bus::{spawn_listener, SyncBus};
use crate::chime::ChimeChannel;
use crate::config::Config;
use crate::focus::{FocusController, FocusStatus};
use crate::model::{Task, TaskDraft, Transaction, TransactionDraft};
use crate::notifier::{NotificationChannel, Notifier};
use crate::scheduler::AlarmScheduler;
use crate::speech::{Speaker, SpokenAlertChannel};
use crate::state::AppState;
use crate::transcriber::WhisperTranscriber;
use crate::voice::{ToolHost, VoiceSessionManager, VoiceStatus};
use crate::wake::{Activity, WakeListener, WhisperRecognizer};

/// Time given to the voice manager to release devices on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

/// Tool host backed by the shared state and the focus timer.
pub struct AssistantHost {
    state: AppState,
    focus: FocusController,
}

impl AssistantHost {
    pub fn new(state: AppState, focus: FocusController) -> Self {
        Self { state, focus }
    }
}

impl ToolHost for AssistantHost {
    fn add_task(&self, draft: TaskDraft) -> Task {
        self.state.add_task(draft)
    }

    fn find_task_by_title(&self, fragment: &str) -> Option<Task> {
        self.state.find_task_by_title(fragment)
    }

    fn delete_task(&self, id: &str) -> Option<Task> {
        self.state.delete_task(id)
    }

    fn add_transaction(&self, draft: TransactionDraft) -> Transaction {
        self.state.add_transaction(draft)
    }

    fn start_focus(&self, task: Option<Task>, minutes: Option<u32>) -> Result<u32, String> {
        self.focus
            .start(task.map(|t| t.id), minutes)
            .map(|session| session.duration_minutes)
    }
}

pub fn activity_of(voice: &VoiceStatus, focus: &FocusStatus) -> Activity {
    Activity {
        voice_active: voice.active,
        focus_active: focus.session.is_active,
    }
}

pub struct AlbaService {
    config: Config,
    state: AppState,
    transcriber: Option<WhisperTranscriber>,
}

impl AlbaService {
    pub fn new(config: Config, state: AppState, transcriber: Option<WhisperTranscriber>) -> Self {
        Self {
            config,
            state,
            transcriber,
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let config = self.config;
        let state = self.state;

        let bus = SyncBus::new();
        let _bus_listener = spawn_listener(&bus, state.clone());

        let (activity_tx, activity_rx) = watch::channel(Activity::default());
        let speaker = Arc::new(Speaker::new(
            config.speech.clone(),
            config.voice.api_key.clone(),
            activity_rx.clone(),
        ));
        let notifier = Arc::new(Notifier::new(config.alerts.notifications, bus.clone()));
        let focus = FocusController::new(state.clone(), speaker.clone(), config.focus.default_minutes);

        // Voice assistant
        let host = Arc::new(AssistantHost::new(state.clone(), focus.clone()));
        let (manager, voice) = VoiceSessionManager::new(config.voice.clone(), host);
        tokio::spawn(manager.run());

        // Alarm scheduler
        let mut scheduler = AlarmScheduler::new(
            state.clone(),
            Duration::from_secs(config.scheduler.poll_interval_secs.max(1)),
            &config.scheduler.default_time,
        );
        if config.alerts.spoken {
            scheduler = scheduler.with_channel(Arc::new(SpokenAlertChannel::new(speaker.clone())));
        }
        if config.alerts.chime {
            scheduler =
                scheduler.with_channel(Arc::new(ChimeChannel::new(config.alerts.vibration_pattern.clone())));
        }
        if config.alerts.notifications {
            scheduler = scheduler.with_channel(Arc::new(NotificationChannel::new(notifier.clone())));
        }
        tokio::spawn(scheduler.run());

        // Wake-word listener
        let (listening_tx, listening_rx) = watch::channel(false);
        match (config.wake_word.enabled, self.transcriber) {
            (true, Some(transcriber)) => {
                let recognizer = WhisperRecognizer::new(&config.wake_word, transcriber);
                let wake_voice = voice.clone();
                let listener = WakeListener::new(
                    &config.wake_word,
                    recognizer,
                    activity_rx.clone(),
                    listening_tx,
                    Arc::new(move || wake_voice.start()),
                );
                tokio::spawn(listener.run());
            }
            (true, None) => warn!("Wake word enabled but no Whisper model loaded"),
            (false, _) => info!("Wake word disabled"),
        }

        // Local API
        if config.api.enabled {
            let api_state = ApiState {
                state: state.clone(),
                bus: bus.clone(),
                notifier: notifier.clone(),
                voice: voice.clone(),
                focus: focus.clone(),
                announcer: speaker.clone(),
                wake_listening: listening_rx,
            };
            start_api(api_state, config.api.port).await;
        }

        info!(
            "Alba ready: {} tasks, {} transactions, {} pending alerts",
            state.tasks().len(),
            state.transactions().len(),
            state.active_alerts().len()
        );

        let mut voice_rx = voice.subscribe();
        let mut focus_rx = focus.subscribe();
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                changed = voice_rx.changed() => {
                    if changed.is_err() {
                        warn!("Voice manager stopped");
                        break;
                    }
                }
                changed = focus_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                result = &mut shutdown => {
                    if let Err(e) = result {
                        warn!("Failed to listen for ctrl-c: {e}");
                    }
                    info!("Shutting down");
                    break;
                }
            }
            let activity = activity_of(&voice_rx.borrow_and_update(), &focus_rx.borrow_and_update());
            activity_tx.send_if_modified(|current| {
                if *current == activity {
                    return false;
                }
                info!(
                    "Activity: voice={} focus={}",
                    activity.voice_active, activity.focus_active
                );
                *current = activity;
                true
            });
        }

        if voice.status().active {
            voice.stop();
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
        focus.end(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::tests::Transcript;
    use crate::state::tests::draft;
    use crate::store::Snapshot;
    use crate::voice::VoiceState;

    #[tokio::test]
    async fn test_host_starts_focus_on_resolved_task() {
        let state = AppState::detached(Snapshot::default());
        let focus = FocusController::new(state.clone(), Arc::new(Transcript::default()), 25);
        let host = AssistantHost::new(state.clone(), focus.clone());
        let task = state.add_task(draft("Escrever relatório", "2024-05-01", None));

        assert_eq!(host.start_focus(Some(task.clone()), None), Ok(25));
        assert_eq!(focus.status().session.task_id, Some(task.id));
        assert!(host.start_focus(None, Some(5)).is_err());
        focus.end(false);
    }

    #[test]
    fn test_activity_follows_voice_and_focus() {
        let mut voice = VoiceStatus::default();
        let focus = FocusStatus {
            session: crate::model::FocusSession::inactive(25),
            remaining_secs: 0,
            paused: false,
        };
        assert!(activity_of(&voice, &focus).is_idle());

        voice.active = true;
        voice.state = VoiceState::Error;
        assert!(activity_of(&voice, &focus).voice_active);

        let mut running = focus.clone();
        running.session.is_active = true;
        voice.active = false;
        assert_eq!(
            activity_of(&voice, &running),
            Activity {
                voice_active: false,
                focus_active: true
            }
        );
    }
}
