//! Sync bus between notification handlers and the running agenda.
//!
//! Fire-and-forget broadcast: a message reaches whoever is subscribed at
//! the moment it is sent and is never replayed. Notification action
//! threads and external processes (through `POST /bus`) publish; the
//! foreground listener applies messages to `AppState`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::state::AppState;

const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Complete,
    Dismiss,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    #[serde(rename = "TASK_ACTION")]
    TaskAction {
        action: TaskAction,
        #[serde(rename = "taskId")]
        task_id: String,
    },
}

impl BusMessage {
    pub fn task_action(action: TaskAction, task_id: impl Into<String>) -> Self {
        Self::TaskAction {
            action,
            task_id: task_id.into(),
        }
    }
}

#[derive(Clone)]
pub struct SyncBus {
    tx: broadcast::Sender<BusMessage>,
}

impl Default for SyncBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Post a message. Returns how many listeners received it; zero is not
    /// an error.
    pub fn post(&self, message: BusMessage) -> usize {
        match self.tx.send(message) {
            Ok(n) => n,
            Err(broadcast::error::SendError(message)) => {
                debug!("No bus listeners, dropping {message:?}");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

/// Apply one bus message to the agenda state.
pub fn apply(state: &AppState, message: &BusMessage) {
    match message {
        BusMessage::TaskAction {
            action: TaskAction::Complete,
            task_id,
        } => {
            if state.toggle_task(task_id).is_none() {
                warn!("Bus complete for unknown task {task_id}");
            }
        }
        BusMessage::TaskAction {
            action: TaskAction::Dismiss,
            task_id,
        } => state.dismiss_alert(task_id),
    }
}

/// Foreground subscriber. Subscribes before returning so nothing posted
/// after this call is missed.
pub fn spawn_listener(bus: &SyncBus, state: AppState) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        info!("Sync bus listener attached");
        loop {
            match rx.recv().await {
                Ok(message) => {
                    debug!("Bus message: {message:?}");
                    apply(&state, &message);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Sync bus listener lagged, {n} message(s) lost");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
