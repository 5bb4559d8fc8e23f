//! Local HTTP API for views and external triggers.
//!
//! Listens on 127.0.0.1 only. Every mutation goes through the same
//! `AppState` functions the scheduler and the voice tools use.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::{BusMessage, SyncBus};
use crate::focus::{FocusController, FocusStatus};
use crate::model::{LedgerSummary, Task, TaskDraft, ThemeColor, Transaction, TransactionDraft};
use crate::notifier::{NotificationRequest, Notifier, PushPayload};
use crate::speech::{task_saved_phrase, transaction_phrase, Announce};
use crate::state::AppState;
use crate::voice::{VoiceHandle, VoiceStatus};

#[derive(Clone)]
pub struct ApiState {
    pub state: AppState,
    pub bus: SyncBus,
    pub notifier: Arc<Notifier>,
    pub voice: VoiceHandle,
    pub focus: FocusController,
    pub announcer: Arc<dyn Announce>,
    pub wake_listening: watch::Receiver<bool>,
}

// --- Request/Response types ---

#[derive(Serialize)]
struct AlertView {
    task: Task,
    /// Unresolved alerts queued behind this one.
    more: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    voice: VoiceStatus,
    focus: FocusStatus,
    wake_listening: bool,
    notifications_available: bool,
    theme: ThemeColor,
    #[serde(skip_serializing_if = "Option::is_none")]
    alert: Option<AlertView>,
    pending_tasks: usize,
}

#[derive(Deserialize)]
struct ThemeRequest {
    theme: ThemeColor,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FocusStartRequest {
    task_id: Option<String>,
    minutes: Option<u32>,
}

#[derive(Deserialize, Default)]
struct FocusEndRequest {
    #[serde(default)]
    completed: bool,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivered: Option<usize>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            error: None,
            delivered: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: Some(message.into()),
            delivered: None,
        }
    }
}

type Reply = (StatusCode, Json<SimpleResponse>);

fn ok(status: &str) -> Reply {
    (StatusCode::OK, Json(SimpleResponse::ok(status)))
}

fn fail(code: StatusCode, message: impl Into<String>) -> Reply {
    (code, Json(SimpleResponse::err(message)))
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/tasks", get(handle_list_tasks).post(handle_add_task))
        .route("/tasks/{id}/toggle", post(handle_toggle_task))
        .route("/tasks/{id}", delete(handle_delete_task))
        .route(
            "/transactions",
            get(handle_list_transactions).post(handle_add_transaction),
        )
        .route("/transactions/{id}", delete(handle_delete_transaction))
        .route("/summary", get(handle_summary))
        .route("/alerts", get(handle_alerts))
        .route("/alerts/{id}/dismiss", post(handle_dismiss_alert))
        .route("/theme", post(handle_theme))
        .route("/bus", post(handle_bus))
        .route("/push", post(handle_push))
        .route("/voice/start", post(handle_voice_start))
        .route("/voice/stop", post(handle_voice_stop))
        .route("/focus/start", post(handle_focus_start))
        .route("/focus/pause", post(handle_focus_pause))
        .route("/focus/resume", post(handle_focus_resume))
        .route("/focus/end", post(handle_focus_end))
        .with_state(state)
}

/// Start the API server as a background tokio task.
pub async fn start_api(state: ApiState, port: u16) {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind API on {addr}: {e}");
            return;
        }
    };
    info!("API server listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("API server error: {e}");
        }
    });
}

// --- Handlers ---

async fn handle_status(State(api): State<ApiState>) -> Json<StatusResponse> {
    let summary = api.state.summary();
    Json(StatusResponse {
        voice: api.voice.status(),
        focus: api.focus.status(),
        wake_listening: *api.wake_listening.borrow(),
        notifications_available: api.notifier.is_available(),
        theme: api.state.theme(),
        alert: api
            .state
            .current_alert()
            .map(|(task, more)| AlertView { task, more }),
        pending_tasks: summary.pending_tasks,
    })
}

async fn handle_list_tasks(State(api): State<ApiState>) -> Json<Vec<Task>> {
    Json(api.state.tasks())
}

async fn handle_add_task(
    State(api): State<ApiState>,
    Json(draft): Json<TaskDraft>,
) -> Result<Json<Task>, Reply> {
    if draft.title.trim().is_empty() {
        return Err(fail(StatusCode::BAD_REQUEST, "empty title"));
    }
    let task = api.state.add_task(draft);
    api.announcer.announce(task_saved_phrase(&task.title));
    Ok(Json(task))
}

async fn handle_toggle_task(
    State(api): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, Reply> {
    api.state
        .toggle_task(&id)
        .map(Json)
        .ok_or_else(|| fail(StatusCode::NOT_FOUND, "task not found"))
}

async fn handle_delete_task(State(api): State<ApiState>, Path(id): Path<String>) -> Reply {
    match api.state.delete_task(&id) {
        Some(_) => ok("deleted"),
        None => fail(StatusCode::NOT_FOUND, "task not found"),
    }
}

async fn handle_list_transactions(State(api): State<ApiState>) -> Json<Vec<Transaction>> {
    Json(api.state.transactions())
}

async fn handle_add_transaction(
    State(api): State<ApiState>,
    Json(draft): Json<TransactionDraft>,
) -> Result<Json<Transaction>, Reply> {
    if !draft.amount.is_finite() {
        return Err(fail(StatusCode::BAD_REQUEST, "invalid amount"));
    }
    let tx = api.state.add_transaction(draft);
    api.announcer.announce(transaction_phrase(tx.amount));
    Ok(Json(tx))
}

async fn handle_delete_transaction(State(api): State<ApiState>, Path(id): Path<String>) -> Reply {
    match api.state.delete_transaction(&id) {
        Some(_) => ok("deleted"),
        None => fail(StatusCode::NOT_FOUND, "transaction not found"),
    }
}

async fn handle_summary(State(api): State<ApiState>) -> Json<LedgerSummary> {
    Json(api.state.summary())
}

async fn handle_alerts(State(api): State<ApiState>) -> Json<Vec<Task>> {
    Json(api.state.active_alerts())
}

async fn handle_dismiss_alert(State(api): State<ApiState>, Path(id): Path<String>) -> Reply {
    api.state.dismiss_alert(&id);
    ok("dismissed")
}

async fn handle_theme(State(api): State<ApiState>, Json(req): Json<ThemeRequest>) -> Reply {
    api.state.set_theme(req.theme);
    ok(req.theme.as_str())
}

async fn handle_bus(
    State(api): State<ApiState>,
    Json(message): Json<BusMessage>,
) -> Json<SimpleResponse> {
    let delivered = api.bus.post(message);
    Json(SimpleResponse {
        delivered: Some(delivered),
        ..SimpleResponse::ok("posted")
    })
}

async fn handle_push(State(api): State<ApiState>, Json(payload): Json<PushPayload>) -> Reply {
    let request = NotificationRequest::from_push(payload);
    info!("HTTP /push: \"{}\" ({})", request.title, request.tag);
    api.notifier.show(request);
    ok("shown")
}

async fn handle_voice_start(State(api): State<ApiState>) -> Reply {
    api.voice.start();
    ok("starting")
}

async fn handle_voice_stop(State(api): State<ApiState>) -> Reply {
    api.voice.stop();
    ok("stopping")
}

async fn handle_focus_start(
    State(api): State<ApiState>,
    body: Option<Json<FocusStartRequest>>,
) -> Result<Json<FocusStatus>, Reply> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    api.focus
        .start(req.task_id, req.minutes)
        .map_err(|e| fail(StatusCode::CONFLICT, e))?;
    Ok(Json(api.focus.status()))
}

async fn handle_focus_pause(State(api): State<ApiState>) -> Reply {
    if api.focus.pause() {
        ok("paused")
    } else {
        fail(StatusCode::CONFLICT, "no running focus session")
    }
}

async fn handle_focus_resume(State(api): State<ApiState>) -> Reply {
    if api.focus.resume() {
        ok("resumed")
    } else {
        fail(StatusCode::CONFLICT, "no paused focus session")
    }
}

async fn handle_focus_end(
    State(api): State<ApiState>,
    body: Option<Json<FocusEndRequest>>,
) -> Reply {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    match api.focus.end(req.completed) {
        Some(_) => ok("ended"),
        None => fail(StatusCode::CONFLICT, "no active focus session"),
    }
}
