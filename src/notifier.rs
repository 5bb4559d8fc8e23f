//! Desktop notifications via notify-rust (D-Bus).
//!
//! Each notification is shown from a detached thread that then blocks
//! waiting for the user's action. That thread never touches the agenda
//! state: it posts a `TASK_ACTION` on the sync bus and returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify_rust::{Hint, Notification, Timeout, Urgency};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::bus::{BusMessage, SyncBus, TaskAction};
use crate::model::Task;
use crate::scheduler::AlarmChannel;

const TAG_PREFIX: &str = "alba-notif-";
const ALARM_VIBRATION: [u32; 5] = [500, 200, 500, 200, 500];
const PUSH_VIBRATION: [u32; 5] = [500, 100, 500, 100, 500];
const CLOSED_ACTION: &str = "__closed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationAction {
    pub id: &'static str,
    pub title: &'static str,
}

pub const COMPLETE_ACTION: NotificationAction = NotificationAction {
    id: "complete",
    title: "Concluir ✅",
};

pub const DISMISS_ACTION: NotificationAction = NotificationAction {
    id: "dismiss",
    title: "Ignorar",
};

/// Everything a notification surface needs to render one alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    /// Idempotency tag: re-showing the same tag replaces the previous one.
    pub tag: String,
    pub vibrate: Vec<u32>,
    pub actions: Vec<NotificationAction>,
    pub task_id: String,
    pub require_interaction: bool,
}

impl NotificationRequest {
    pub fn for_task(task: &Task) -> Self {
        let time_prefix = task
            .due_time_label()
            .map(|t| format!(" [{t}]"))
            .unwrap_or_default();
        Self {
            title: format!("ALBA:{time_prefix} {}", task.title),
            body: "Hora do seu compromisso agora!".into(),
            tag: tag_for(&task.id),
            vibrate: ALARM_VIBRATION.to_vec(),
            actions: vec![COMPLETE_ACTION, DISMISS_ACTION],
            task_id: task.id.clone(),
            require_interaction: true,
        }
    }

    pub fn from_push(payload: PushPayload) -> Self {
        let task_id = payload.task_id.unwrap_or_else(|| "general".into());
        Self {
            title: payload.title.unwrap_or_else(|| "Alerta Alba".into()),
            body: payload.body.unwrap_or_else(|| "Lembrete da Alba!".into()),
            tag: tag_for(&task_id),
            vibrate: PUSH_VIBRATION.to_vec(),
            actions: vec![COMPLETE_ACTION, DISMISS_ACTION],
            task_id,
            require_interaction: true,
        }
    }

    /// Stable non-zero replacement id derived from the tag (FNV-1a).
    pub fn replace_id(&self) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in self.tag.bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash.max(1)
    }
}

/// Externally triggered notification.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub task_id: Option<String>,
}

pub fn tag_for(task_id: &str) -> String {
    format!("{TAG_PREFIX}{task_id}")
}

/// Map a clicked action to the bus message the handler posts.
/// Closing the bubble without interacting posts nothing.
pub fn message_for_action(action: &str, task_id: &str) -> Option<BusMessage> {
    match action {
        CLOSED_ACTION => None,
        "complete" => Some(BusMessage::task_action(TaskAction::Complete, task_id)),
        _ => Some(BusMessage::task_action(TaskAction::Dismiss, task_id)),
    }
}

pub struct Notifier {
    enabled: bool,
    bus: SyncBus,
    available: Arc<AtomicBool>,
}

impl Notifier {
    pub fn new(enabled: bool, bus: SyncBus) -> Self {
        Self {
            enabled,
            bus,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// False after the notification daemon refused a notification.
    pub fn is_available(&self) -> bool {
        self.enabled && self.available.load(Ordering::Relaxed)
    }

    pub fn show(&self, request: NotificationRequest) {
        if !self.enabled {
            return;
        }

        debug!("Notification: {} ({})", request.title, request.tag);

        let mut notification = Notification::new();
        notification
            .summary(&request.title)
            .body(&request.body)
            .icon("appointment-soon")
            .appname("alba")
            .id(request.replace_id())
            .hint(Hint::Category("reminder".into()))
            .hint(Hint::Custom(
                "x-alba-vibrate".into(),
                request
                    .vibrate
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ));
        for action in &request.actions {
            notification.action(action.id, action.title);
        }
        if request.require_interaction {
            notification.urgency(Urgency::Critical).timeout(Timeout::Never);
        } else {
            notification.timeout(Timeout::Default);
        }

        let bus = self.bus.clone();
        let available = self.available.clone();
        let task_id = request.task_id;
        std::thread::spawn(move || {
            let handle = match notification.show() {
                Ok(handle) => {
                    available.store(true, Ordering::Relaxed);
                    handle
                }
                Err(e) => {
                    available.store(false, Ordering::Relaxed);
                    warn!("Failed to show notification: {e}");
                    return;
                }
            };
            handle.wait_for_action(|action| {
                if let Some(message) = message_for_action(action, &task_id) {
                    info!("Notification action '{action}' for task {task_id}");
                    bus.post(message);
                    info!("Focus requested by notification click");
                }
            });
        });
    }
}

/// Alarm channel that shows the system notification for a due task.
pub struct NotificationChannel {
    notifier: Arc<Notifier>,
}

impl NotificationChannel {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self { notifier }
    }
}

impl AlarmChannel for NotificationChannel {
    fn name(&self) -> &'static str {
        "notification"
    }

    fn fire(&self, task: &Task) -> Result<(), String> {
        if !self.notifier.enabled {
            return Ok(());
        }
        self.notifier.show(NotificationRequest::for_task(task));
        Ok(())
    }
}
