//! Focus timer.
//!
//! One countdown at a time, optionally bound to a task. Ending a completed
//! session marks the bound task done. Status is published on a watch
//! channel so the wake-word listener can stay quiet while the user focuses.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::model::FocusSession;
use crate::speech::{Announce, FOCUS_ENDED_PHRASE};
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusStatus {
    #[serde(flatten)]
    pub session: FocusSession,
    pub remaining_secs: u64,
    pub paused: bool,
}

impl FocusStatus {
    fn idle(default_minutes: u32) -> Self {
        Self {
            session: FocusSession::inactive(default_minutes),
            remaining_secs: 0,
            paused: false,
        }
    }
}

#[derive(Clone)]
pub struct FocusController {
    status: Arc<Mutex<FocusStatus>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    published: Arc<watch::Sender<FocusStatus>>,
    state: AppState,
    announcer: Arc<dyn Announce>,
    default_minutes: u32,
    tick: Duration,
}

impl FocusController {
    pub fn new(state: AppState, announcer: Arc<dyn Announce>, default_minutes: u32) -> Self {
        Self::with_tick(state, announcer, default_minutes, Duration::from_secs(1))
    }

    /// `tick` is the length of one countdown second.
    pub fn with_tick(
        state: AppState,
        announcer: Arc<dyn Announce>,
        default_minutes: u32,
        tick: Duration,
    ) -> Self {
        let idle = FocusStatus::idle(default_minutes);
        let (published, _) = watch::channel(idle.clone());
        Self {
            status: Arc::new(Mutex::new(idle)),
            ticker: Arc::new(Mutex::new(None)),
            published: Arc::new(published),
            state,
            announcer,
            default_minutes,
            tick,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FocusStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, status: FocusStatus) {
        self.published.send_replace(status);
    }

    pub fn status(&self) -> FocusStatus {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FocusStatus> {
        self.published.subscribe()
    }

    pub fn start(&self, task_id: Option<String>, minutes: Option<u32>) -> Result<FocusSession, String> {
        let minutes = minutes.unwrap_or(self.default_minutes);
        if minutes == 0 {
            return Err("duração inválida".into());
        }
        let task_title = match &task_id {
            Some(id) => Some(
                self.state
                    .task(id)
                    .ok_or_else(|| "tarefa não encontrada".to_string())?
                    .title,
            ),
            None => None,
        };

        let snapshot = {
            let mut status = self.lock();
            if status.session.is_active {
                return Err("já existe uma sessão de foco ativa".into());
            }
            *status = FocusStatus {
                session: FocusSession {
                    is_active: true,
                    task_id,
                    task_title,
                    duration_minutes: minutes,
                },
                remaining_secs: u64::from(minutes) * 60,
                paused: false,
            };
            status.clone()
        };
        self.publish(snapshot.clone());
        info!(
            "Focus started: {} min{}",
            minutes,
            snapshot
                .session
                .task_title
                .as_deref()
                .map(|t| format!(" on '{t}'"))
                .unwrap_or_default()
        );

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.tick);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if this.count_down() {
                    this.end(true);
                    break;
                }
            }
        });
        if let Some(old) = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            old.abort();
        }
        Ok(snapshot.session)
    }

    /// One second of countdown. True when the session just ran out.
    fn count_down(&self) -> bool {
        let snapshot = {
            let mut status = self.lock();
            if !status.session.is_active || status.paused || status.remaining_secs == 0 {
                return false;
            }
            status.remaining_secs -= 1;
            status.clone()
        };
        let expired = snapshot.remaining_secs == 0;
        self.publish(snapshot);
        expired
    }

    fn set_paused(&self, paused: bool) -> bool {
        let snapshot = {
            let mut status = self.lock();
            if !status.session.is_active || status.paused == paused {
                return false;
            }
            status.paused = paused;
            status.clone()
        };
        self.publish(snapshot);
        info!("Focus {}", if paused { "paused" } else { "resumed" });
        true
    }

    pub fn pause(&self) -> bool {
        self.set_paused(true)
    }

    pub fn resume(&self) -> bool {
        self.set_paused(false)
    }

    /// Stop the session. With `completed`, the bound task is marked done.
    pub fn end(&self, completed: bool) -> Option<FocusSession> {
        let ended = {
            let mut status = self.lock();
            if !status.session.is_active {
                return None;
            }
            std::mem::replace(&mut *status, FocusStatus::idle(self.default_minutes)).session
        };
        if let Some(handle) = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        if completed {
            if let Some(id) = &ended.task_id {
                match self.state.task(id) {
                    Some(task) if !task.completed => {
                        self.state.toggle_task(id);
                    }
                    Some(_) => {}
                    None => warn!("Focus task {id} no longer exists"),
                }
            }
        }

        self.publish(FocusStatus::idle(self.default_minutes));
        self.announcer.announce(FOCUS_ENDED_PHRASE.into());
        info!("Focus ended (completed={completed})");
        Some(ended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::tests::Transcript;
    use crate::state::tests::draft;
    use crate::store::Snapshot;

    fn controller(tick: Duration) -> (FocusController, AppState, Arc<Transcript>) {
        let state = AppState::detached(Snapshot::default());
        let transcript = Arc::new(Transcript::default());
        let focus = FocusController::with_tick(state.clone(), transcript.clone(), 25, tick);
        (focus, state, transcript)
    }

    #[tokio::test]
    async fn test_start_defaults_to_25_minutes() {
        let (focus, _, _) = controller(Duration::from_secs(1));
        let session = focus.start(None, None).unwrap();
        assert!(session.is_active);
        assert_eq!(session.duration_minutes, 25);
        assert_eq!(focus.status().remaining_secs, 1500);
        assert!(focus.start(None, Some(10)).is_err());
        focus.end(false);
    }

    #[tokio::test]
    async fn test_rejects_unknown_task_and_zero_minutes() {
        let (focus, _, _) = controller(Duration::from_secs(1));
        assert!(focus.start(Some("missing".into()), None).is_err());
        assert!(focus.start(None, Some(0)).is_err());
        assert!(!focus.status().session.is_active);
    }

    #[tokio::test]
    async fn test_completed_end_marks_task_done() {
        let (focus, state, transcript) = controller(Duration::from_secs(1));
        let task = state.add_task(draft("Estudar", "2024-05-01", None));
        let session = focus.start(Some(task.id.clone()), Some(50)).unwrap();
        assert_eq!(session.task_title.as_deref(), Some("Estudar"));

        let ended = focus.end(true).unwrap();
        assert_eq!(ended.task_id.as_deref(), Some(task.id.as_str()));
        assert!(state.task(&task.id).unwrap().completed);
        assert_eq!(*transcript.0.lock().unwrap(), vec!["Foco encerrado.".to_string()]);
        assert!(focus.end(true).is_none());
    }

    #[tokio::test]
    async fn test_abandoned_end_leaves_task_open() {
        let (focus, state, _) = controller(Duration::from_secs(1));
        let task = state.add_task(draft("Estudar", "2024-05-01", None));
        focus.start(Some(task.id.clone()), None).unwrap();
        focus.end(false);
        assert!(!state.task(&task.id).unwrap().completed);
    }

    #[tokio::test]
    async fn test_expiry_completes_bound_task() {
        let (focus, state, transcript) = controller(Duration::from_millis(1));
        let task = state.add_task(draft("Ler", "2024-05-01", None));
        let mut updates = focus.subscribe();
        focus.start(Some(task.id.clone()), Some(1)).unwrap();

        for _ in 0..300 {
            if !focus.status().session.is_active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!focus.status().session.is_active);
        assert!(state.task(&task.id).unwrap().completed);
        assert_eq!(transcript.0.lock().unwrap().len(), 1);
        assert!(!updates.borrow_and_update().session.is_active);
    }

    #[tokio::test]
    async fn test_pause_freezes_countdown() {
        let (focus, _, _) = controller(Duration::from_millis(2));
        focus.start(None, Some(1)).unwrap();
        assert!(focus.pause());
        assert!(!focus.pause());
        let frozen = focus.status().remaining_secs;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(focus.status().remaining_secs, frozen);
        assert!(focus.status().paused);

        assert!(focus.resume());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(focus.status().remaining_secs < frozen);
        focus.end(false);
    }
}
