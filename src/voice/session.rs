//! Voice session state machine and its supervisor.
//!
//! `VoiceSession` holds the open resources of one connected session and
//! reacts to capture frames, server events and playback completions. Every
//! handler checks the shared closing flag first, so once teardown starts no
//! late callback can send audio, dispatch a tool or touch playback.
//!
//! `VoiceSessionManager` drives sessions: it acquires resources through a
//! `SessionOpener`, runs the event loop and reconnects after transport loss
//! under a `RetryPolicy`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::VoiceConfig;
use crate::model::parse_hhmm;
use crate::voice::capture::{Backlog, MicCapture, MicStream};
use crate::voice::codec::{decode_chunk, duration_secs, encode_frame};
use crate::voice::playback::{PlaybackQueue, PlaybackSink, RodioPlayback};
use crate::voice::tools::{declarations, dispatch, ToolCall, ToolHost, ToolOutcome};
use crate::voice::transport::{FunctionCall, LiveClient, LiveLink, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    Idle,
    Connecting,
    Listening,
    Thinking,
    Speaking,
    Error,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceStatus {
    pub state: VoiceState,
    /// True from a start request until the session is fully released.
    pub active: bool,
    pub transcript: String,
    pub error: Option<String>,
}

impl Default for VoiceStatus {
    fn default() -> Self {
        Self {
            state: VoiceState::Idle,
            active: false,
            transcript: String::new(),
            error: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum InitError {
    /// Microphone or audio output unavailable. Not retried.
    #[error("audio device unavailable: {0}")]
    Permission(String),
    /// Could not reach the remote model. Retried.
    #[error("connection failed: {0}")]
    Transport(String),
    /// Missing settings. Not retried.
    #[error("voice assistant not configured: {0}")]
    Config(String),
}

/// Fixed backoff with a cap on consecutive failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Duration,
    max_attempts: u32,
    failures: u32,
}

impl RetryPolicy {
    pub fn new(backoff: Duration, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts,
            failures: 0,
        }
    }

    pub fn on_success(&mut self) {
        self.failures = 0;
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        (self.failures <= self.max_attempts).then_some(self.backoff)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// What the event loop does after a handler ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    /// The assistant asked to close.
    Close,
    /// Transport gone; reconnect unless closing.
    Lost(String),
}

pub struct VoiceSession {
    mic: Option<Box<dyn MicStream>>,
    playback: Option<Box<dyn PlaybackSink>>,
    link: Option<Box<dyn LiveLink>>,
    queue: PlaybackQueue,
    closing: Arc<AtomicBool>,
    status: watch::Sender<VoiceStatus>,
    host: Arc<dyn ToolHost>,
    default_time: NaiveTime,
    input_gain: f32,
    output_rate: u32,
    ended_tx: UnboundedSender<u64>,
}

impl VoiceSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mic: Box<dyn MicStream>,
        playback: Box<dyn PlaybackSink>,
        link: Box<dyn LiveLink>,
        closing: Arc<AtomicBool>,
        status: watch::Sender<VoiceStatus>,
        host: Arc<dyn ToolHost>,
        config: &VoiceConfig,
        ended_tx: UnboundedSender<u64>,
    ) -> Self {
        let default_time = parse_hhmm(&config.default_task_time)
            .unwrap_or_else(|_| NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN));
        Self {
            mic: Some(mic),
            playback: Some(playback),
            link: Some(link),
            queue: PlaybackQueue::new(),
            closing,
            status,
            host,
            default_time,
            input_gain: config.input_gain,
            output_rate: config.output_sample_rate,
            ended_tx,
        }
    }

    fn closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: VoiceState) {
        self.status.send_modify(|s| {
            if s.state != state {
                debug!("Voice state: {:?} -> {:?}", s.state, state);
                s.state = state;
            }
        });
    }

    pub fn on_open(&self) {
        if self.closing() {
            return;
        }
        self.status.send_modify(|s| s.error = None);
        self.set_state(VoiceState::Listening);
    }

    pub fn on_capture_frame(&self, frame: &[f32]) {
        if self.closing() {
            return;
        }
        if let Some(link) = &self.link {
            if let Err(e) = link.send_audio(encode_frame(frame, self.input_gain)) {
                debug!("Dropping audio frame: {e}");
            }
        }
    }

    pub fn on_server_event(&mut self, event: ServerEvent) -> Flow {
        if self.closing() {
            return Flow::Continue;
        }
        match event {
            ServerEvent::ToolCall(calls) => {
                self.set_state(VoiceState::Thinking);
                self.handle_tool_calls(calls)
            }
            ServerEvent::Audio(data) => {
                self.handle_audio(&data);
                Flow::Continue
            }
            ServerEvent::Transcription(text) => {
                self.status.send_modify(|s| s.transcript = text);
                Flow::Continue
            }
            ServerEvent::TurnComplete => {
                if self.queue.pending() == 0 {
                    self.set_state(VoiceState::Listening);
                }
                Flow::Continue
            }
            ServerEvent::Interrupted => {
                debug!("Model interrupted, flushing playback");
                if let Some(playback) = &self.playback {
                    playback.stop_all();
                }
                self.queue.reset();
                self.set_state(VoiceState::Listening);
                Flow::Continue
            }
            ServerEvent::Error(e) => Flow::Lost(e),
            ServerEvent::Closed(reason) => Flow::Lost(reason),
        }
    }

    fn handle_tool_calls(&mut self, calls: Vec<FunctionCall>) -> Flow {
        for call in calls {
            let reply = match ToolCall::parse(&call.name, &call.args) {
                Ok(parsed) => {
                    info!("Tool call: {}", parsed.name());
                    match dispatch(parsed, self.host.as_ref(), self.default_time) {
                        ToolOutcome::Reply(text) => text,
                        ToolOutcome::Close => {
                            info!("Assistant requested close");
                            return Flow::Close;
                        }
                    }
                }
                Err(e) => {
                    warn!("Rejected tool call '{}': {e}", call.name);
                    e.to_string()
                }
            };
            if let Some(link) = &self.link {
                if let Err(e) = link.send_tool_response(&call.id, &call.name, &reply) {
                    warn!("Failed to send tool response: {e}");
                }
            }
        }
        Flow::Continue
    }

    fn handle_audio(&mut self, data: &str) {
        let samples = decode_chunk(data);
        if samples.is_empty() {
            return;
        }
        let Some(playback) = &self.playback else {
            return;
        };
        self.set_state(VoiceState::Speaking);

        let now = playback.now();
        let duration = duration_secs(samples.len(), self.output_rate);
        let scheduled = self.queue.schedule(now, duration);
        playback.enqueue(samples);

        let delay = Duration::from_secs_f64((scheduled.end - now).max(0.0));
        let ended_tx = self.ended_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = ended_tx.send(scheduled.generation);
        });
    }

    pub fn on_playback_ended(&mut self, generation: u64) {
        if self.closing() {
            return;
        }
        if self.queue.finish(generation) {
            self.set_state(VoiceState::Listening);
        }
    }

    /// Release devices and the link without marking the session closing
    /// (used before a reconnect).
    pub fn release(&mut self) {
        if let Some(playback) = &self.playback {
            playback.stop_all();
        }
        self.queue.reset();
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        if let Some(mut mic) = self.mic.take() {
            mic.stop();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }
    }

    /// Manual close. Idempotent.
    pub fn teardown(&mut self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            self.release();
            return;
        }
        self.release();
        self.set_state(VoiceState::Closing);
        info!("Voice session closed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCommand {
    Start,
    Stop,
}

/// Cheap handle used by the rest of the app to drive the manager.
#[derive(Clone)]
pub struct VoiceHandle {
    commands: UnboundedSender<VoiceCommand>,
    status: watch::Receiver<VoiceStatus>,
}

impl VoiceHandle {
    pub fn start(&self) {
        let _ = self.commands.send(VoiceCommand::Start);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(VoiceCommand::Stop);
    }

    pub fn status(&self) -> VoiceStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VoiceStatus> {
        self.status.clone()
    }
}

enum Ended {
    Manual,
    Lost(String),
}

/// Everything one connected session needs, freshly acquired.
pub struct Resources {
    pub mic: Box<dyn MicStream>,
    pub playback: Box<dyn PlaybackSink>,
    pub link: Box<dyn LiveLink>,
    pub frames: UnboundedReceiver<Vec<f32>>,
    pub events: UnboundedReceiver<ServerEvent>,
    pub backlog: Backlog,
}

/// Acquires the microphone, the speaker and the remote link for a session.
pub trait SessionOpener: Send + Sync + 'static {
    fn open(
        &self,
        closing: Arc<AtomicBool>,
    ) -> impl Future<Output = Result<Resources, InitError>> + Send;
}

/// Real devices plus a Gemini Live connection.
pub struct DeviceOpener {
    config: VoiceConfig,
}

impl DeviceOpener {
    pub fn new(config: VoiceConfig) -> Self {
        Self { config }
    }
}

impl SessionOpener for DeviceOpener {
    async fn open(&self, closing: Arc<AtomicBool>) -> Result<Resources, InitError> {
        if self.config.api_key.is_empty() {
            return Err(InitError::Config(
                "no API key configured (voice.api_key or GEMINI_API_KEY)".into(),
            ));
        }

        let (frames_tx, frames) = mpsc::unbounded_channel();
        let backlog = Backlog::default();
        let (rate, frame_size) = (self.config.input_sample_rate, self.config.frame_size);
        let mic_backlog = backlog.clone();
        // Device threads hand back readiness over a blocking channel
        let mic = tokio::task::spawn_blocking(move || {
            MicCapture::open(rate, frame_size, closing, frames_tx, mic_backlog)
        })
        .await
        .map_err(|e| InitError::Permission(e.to_string()))?
        .map_err(InitError::Permission)?;
        let mut mic: Box<dyn MicStream> = Box::new(mic);

        let output_rate = self.config.output_sample_rate;
        let playback = tokio::task::spawn_blocking(move || RodioPlayback::open(output_rate))
            .await
            .map_err(|e| InitError::Permission(e.to_string()))
            .and_then(|opened| opened.map_err(InitError::Permission));
        let mut playback: Box<dyn PlaybackSink> = match playback {
            Ok(p) => Box::new(p),
            Err(e) => {
                mic.stop();
                return Err(e);
            }
        };

        let (link, events) = match LiveClient::connect(&self.config, declarations()).await {
            Ok(pair) => pair,
            Err(e) => {
                mic.stop();
                playback.close();
                return Err(InitError::Transport(e));
            }
        };

        Ok(Resources {
            mic,
            playback,
            link: Box::new(link),
            frames,
            events,
            backlog,
        })
    }
}

struct Opened {
    session: VoiceSession,
    frames_rx: UnboundedReceiver<Vec<f32>>,
    events_rx: UnboundedReceiver<ServerEvent>,
    ended_rx: UnboundedReceiver<u64>,
    backlog: Backlog,
}

pub struct VoiceSessionManager<O = DeviceOpener> {
    config: VoiceConfig,
    host: Arc<dyn ToolHost>,
    opener: O,
    status: watch::Sender<VoiceStatus>,
    commands: UnboundedReceiver<VoiceCommand>,
}

impl VoiceSessionManager {
    pub fn new(config: VoiceConfig, host: Arc<dyn ToolHost>) -> (Self, VoiceHandle) {
        let opener = DeviceOpener::new(config.clone());
        Self::with_opener(config, host, opener)
    }
}

impl<O: SessionOpener> VoiceSessionManager<O> {
    pub fn with_opener(
        config: VoiceConfig,
        host: Arc<dyn ToolHost>,
        opener: O,
    ) -> (Self, VoiceHandle) {
        let (status, status_rx) = watch::channel(VoiceStatus::default());
        let (commands_tx, commands) = mpsc::unbounded_channel();
        (
            Self {
                config,
                host,
                opener,
                status,
                commands,
            },
            VoiceHandle {
                commands: commands_tx,
                status: status_rx,
            },
        )
    }

    fn publish(&self, state: VoiceState, active: bool, error: Option<String>) {
        self.status.send_modify(|s| {
            s.state = state;
            s.active = active;
            if error.is_some() {
                s.error = error;
            }
        });
    }

    pub async fn run(mut self) {
        info!("Voice session manager ready");
        while let Some(command) = self.commands.recv().await {
            match command {
                VoiceCommand::Start => {
                    if !self.config.enabled {
                        warn!("Voice assistant disabled in config");
                        continue;
                    }
                    self.supervise().await;
                    self.publish(VoiceState::Idle, false, None);
                }
                VoiceCommand::Stop => debug!("Voice stop with no active session"),
            }
        }
    }

    /// One user-visible session, including reconnects.
    async fn supervise(&mut self) {
        let mut retry = RetryPolicy::new(
            Duration::from_millis(self.config.reconnect_backoff_ms),
            self.config.max_reconnect_attempts,
        );
        self.status.send_modify(|s| s.transcript.clear());

        loop {
            self.publish(VoiceState::Connecting, true, None);
            let closing = Arc::new(AtomicBool::new(false));

            let reason = match self.open(closing).await {
                Ok(opened) => {
                    retry.on_success();
                    match self.drive(opened).await {
                        Ended::Manual => {
                            self.publish(VoiceState::Closing, true, None);
                            return;
                        }
                        Ended::Lost(reason) => reason,
                    }
                }
                Err(e @ (InitError::Permission(_) | InitError::Config(_))) => {
                    error!("Voice session cannot start: {e}");
                    self.publish(VoiceState::Error, true, Some(e.to_string()));
                    return;
                }
                Err(InitError::Transport(e)) => e,
            };

            warn!("Voice session lost: {reason}");
            self.publish(VoiceState::Error, true, Some(reason));
            let Some(delay) = retry.on_failure() else {
                error!(
                    "Giving up after {} consecutive reconnect attempts",
                    retry.failures() - 1
                );
                return;
            };
            info!("Reconnecting in {delay:?}");
            if self.wait_or_stop(delay).await {
                self.publish(VoiceState::Closing, true, None);
                return;
            }
        }
    }

    /// Sleep for `delay`; returns true if a stop arrived meanwhile.
    async fn wait_or_stop(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                command = self.commands.recv() => match command {
                    Some(VoiceCommand::Stop) | None => return true,
                    Some(VoiceCommand::Start) => debug!("Voice session already starting"),
                },
            }
        }
    }

    async fn open(&self, closing: Arc<AtomicBool>) -> Result<Opened, InitError> {
        let resources = self.opener.open(closing.clone()).await?;
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let session = VoiceSession::new(
            resources.mic,
            resources.playback,
            resources.link,
            closing,
            self.status.clone(),
            self.host.clone(),
            &self.config,
            ended_tx,
        );
        session.on_open();
        Ok(Opened {
            session,
            frames_rx: resources.frames,
            events_rx: resources.events,
            ended_rx,
            backlog: resources.backlog,
        })
    }

    async fn drive(&mut self, opened: Opened) -> Ended {
        let Opened {
            mut session,
            mut frames_rx,
            mut events_rx,
            mut ended_rx,
            backlog,
        } = opened;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(VoiceCommand::Stop) | None => {
                        session.teardown();
                        return Ended::Manual;
                    }
                    Some(VoiceCommand::Start) => debug!("Voice session already active"),
                },
                Some(frame) = frames_rx.recv() => {
                    backlog.pop();
                    session.on_capture_frame(&frame);
                }
                event = events_rx.recv() => {
                    let flow = match event {
                        Some(event) => session.on_server_event(event),
                        None => Flow::Lost("event stream ended".into()),
                    };
                    match flow {
                        Flow::Continue => {}
                        Flow::Close => {
                            session.teardown();
                            return Ended::Manual;
                        }
                        Flow::Lost(reason) => {
                            session.release();
                            return Ended::Lost(reason);
                        }
                    }
                }
                Some(generation) = ended_rx.recv() => session.on_playback_ended(generation),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::tools::tests::TestHost;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        mic_stopped: AtomicBool,
        playback_closed: AtomicBool,
        link_closed: AtomicBool,
        stop_all: AtomicUsize,
        enqueued: AtomicUsize,
        audio_sent: AtomicUsize,
        responses: Mutex<Vec<(String, String, String)>>,
    }

    struct FakeMic(Arc<Recorded>);
    impl MicStream for FakeMic {
        fn stop(&mut self) {
            self.0.mic_stopped.store(true, Ordering::SeqCst);
        }
    }

    struct FakePlayback(Arc<Recorded>);
    impl PlaybackSink for FakePlayback {
        fn now(&self) -> f64 {
            10.0
        }
        fn enqueue(&self, _samples: Vec<f32>) {
            self.0.enqueued.fetch_add(1, Ordering::SeqCst);
        }
        fn stop_all(&self) {
            self.0.stop_all.fetch_add(1, Ordering::SeqCst);
        }
        fn close(&mut self) {
            self.0.playback_closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeLink(Arc<Recorded>);
    impl LiveLink for FakeLink {
        fn send_audio(&self, _pcm: String) -> Result<(), String> {
            self.0.audio_sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn send_tool_response(&self, id: &str, name: &str, result: &str) -> Result<(), String> {
            self.0
                .responses
                .lock()
                .unwrap()
                .push((id.into(), name.into(), result.into()));
            Ok(())
        }
        fn close(&mut self) {
            self.0.link_closed.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        session: VoiceSession,
        seen: Arc<Recorded>,
        host: Arc<TestHost>,
        status: watch::Receiver<VoiceStatus>,
        _ended_rx: UnboundedReceiver<u64>,
    }

    fn harness() -> Harness {
        let seen = Arc::new(Recorded::default());
        let host = Arc::new(TestHost::new());
        let (status_tx, status) = watch::channel(VoiceStatus::default());
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let session = VoiceSession::new(
            Box::new(FakeMic(seen.clone())),
            Box::new(FakePlayback(seen.clone())),
            Box::new(FakeLink(seen.clone())),
            Arc::new(AtomicBool::new(false)),
            status_tx,
            host.clone(),
            &VoiceConfig::default(),
            ended_tx,
        );
        session.on_open();
        Harness {
            session,
            seen,
            host,
            status,
            _ended_rx: ended_rx,
        }
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> FunctionCall {
        FunctionCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    fn pcm_chunk(samples: usize) -> String {
        STANDARD.encode(vec![0u8; samples * 2])
    }

    #[test]
    fn test_tool_call_is_answered_with_result() {
        let mut h = harness();
        let flow = h.session.on_server_event(ServerEvent::ToolCall(vec![call(
            "c1",
            "add_task",
            json!({"title": "Reunião", "date": "2024-05-01"}),
        )]));
        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.status.borrow().state, VoiceState::Thinking);
        assert_eq!(
            *h.seen.responses.lock().unwrap(),
            vec![("c1".into(), "add_task".into(), "Tarefa adicionada para as 08:00".into())]
        );
        assert_eq!(h.host.state.tasks().len(), 1);
    }

    #[test]
    fn test_close_assistant_stops_the_rest_of_the_message() {
        let mut h = harness();
        let flow = h.session.on_server_event(ServerEvent::ToolCall(vec![
            call("c1", "add_task", json!({"title": "Antes", "date": "2024-05-01"})),
            call("c2", "close_assistant", json!({})),
            call("c3", "add_task", json!({"title": "Depois", "date": "2024-05-01"})),
        ]));
        assert_eq!(flow, Flow::Close);
        h.session.teardown();

        let titles: Vec<String> = h.host.state.tasks().into_iter().map(|t| t.title).collect();
        assert_eq!(titles, vec!["Antes".to_string()]);
        assert_eq!(h.seen.responses.lock().unwrap().len(), 1);
        assert!(h.seen.mic_stopped.load(Ordering::SeqCst));
        assert!(h.seen.link_closed.load(Ordering::SeqCst));
        assert!(h.seen.playback_closed.load(Ordering::SeqCst));
        assert_eq!(h.status.borrow().state, VoiceState::Closing);
    }

    #[test]
    fn test_nothing_runs_after_teardown() {
        let mut h = harness();
        h.session.teardown();
        h.session.teardown();

        h.session.on_capture_frame(&[0.1; 16]);
        let flow = h.session.on_server_event(ServerEvent::ToolCall(vec![call(
            "c1",
            "add_task",
            json!({"title": "x", "date": "2024-05-01"}),
        )]));

        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.seen.audio_sent.load(Ordering::SeqCst), 0);
        assert!(h.host.state.tasks().is_empty());
        assert_eq!(h.status.borrow().state, VoiceState::Closing);
    }

    #[test]
    fn test_unknown_tool_gets_unsupported_reply() {
        let mut h = harness();
        h.session
            .on_server_event(ServerEvent::ToolCall(vec![call("c9", "navigate", json!({}))]));
        assert_eq!(
            h.seen.responses.lock().unwrap()[0].2,
            "Operação não suportada: navigate"
        );
    }

    #[test]
    fn test_non_finite_amount_is_answered_not_stored() {
        let mut h = harness();
        h.session.on_server_event(ServerEvent::ToolCall(vec![call(
            "c1",
            "add_transaction",
            json!({"description": "Pix", "amount": "NaN", "type": "income"}),
        )]));
        assert!(h.host.state.transactions().is_empty());
        assert!(h.host.state.summary().balance.is_finite());
        let responses = h.seen.responses.lock().unwrap();
        assert!(responses[0].2.starts_with("Argumento inválido 'amount'"));
    }

    #[test]
    fn test_frames_are_forwarded_while_open() {
        let h = harness();
        h.session.on_capture_frame(&[0.0; 2048]);
        h.session.on_capture_frame(&[0.0; 2048]);
        assert_eq!(h.seen.audio_sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_speaking_until_last_chunk_ends() {
        let mut h = harness();
        h.session.on_server_event(ServerEvent::Audio(pcm_chunk(2400)));
        h.session.on_server_event(ServerEvent::Audio(pcm_chunk(2400)));
        assert_eq!(h.status.borrow().state, VoiceState::Speaking);
        assert_eq!(h.seen.enqueued.load(Ordering::SeqCst), 2);

        let generation = h.session.queue.generation();
        h.session.on_playback_ended(generation);
        assert_eq!(h.status.borrow().state, VoiceState::Speaking);
        h.session.on_playback_ended(generation);
        assert_eq!(h.status.borrow().state, VoiceState::Listening);
    }

    #[tokio::test]
    async fn test_undecodable_audio_is_ignored() {
        let mut h = harness();
        h.session.on_server_event(ServerEvent::Audio("@@@".into()));
        assert_eq!(h.seen.enqueued.load(Ordering::SeqCst), 0);
        assert_eq!(h.status.borrow().state, VoiceState::Listening);
    }

    #[tokio::test]
    async fn test_interrupt_flushes_playback() {
        let mut h = harness();
        h.session.on_server_event(ServerEvent::Audio(pcm_chunk(24000)));
        let stale = h.session.queue.generation();
        h.session.on_server_event(ServerEvent::Interrupted);

        assert_eq!(h.seen.stop_all.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.queue.pending(), 0);
        assert_eq!(h.status.borrow().state, VoiceState::Listening);

        h.session.on_server_event(ServerEvent::Audio(pcm_chunk(2400)));
        h.session.on_playback_ended(stale);
        assert_eq!(h.status.borrow().state, VoiceState::Speaking);
    }

    #[test]
    fn test_transcription_updates_transcript_only() {
        let mut h = harness();
        h.session
            .on_server_event(ServerEvent::Transcription("apaga a reunião".into()));
        let status = h.status.borrow();
        assert_eq!(status.transcript, "apaga a reunião");
        assert_eq!(status.state, VoiceState::Listening);
    }

    #[test]
    fn test_transport_loss_is_reported() {
        let mut h = harness();
        let flow = h.session.on_server_event(ServerEvent::Closed("1006".into()));
        assert_eq!(flow, Flow::Lost("1006".into()));
        h.session.release();
        assert!(h.seen.mic_stopped.load(Ordering::SeqCst));
        assert!(!h.session.closing());
    }

    #[test]
    fn test_retry_policy_caps_and_resets() {
        let mut retry = RetryPolicy::new(Duration::from_millis(2000), 2);
        assert_eq!(retry.on_failure(), Some(Duration::from_millis(2000)));
        assert_eq!(retry.on_failure(), Some(Duration::from_millis(2000)));
        assert_eq!(retry.on_failure(), None);

        retry.on_success();
        assert_eq!(retry.failures(), 0);
        assert!(retry.on_failure().is_some());
    }

    #[derive(Default)]
    struct Opens {
        count: AtomicUsize,
        failures: Mutex<VecDeque<InitError>>,
        events: Mutex<Vec<UnboundedSender<ServerEvent>>>,
        frames: Mutex<Vec<UnboundedSender<Vec<f32>>>>,
        seen: Arc<Recorded>,
    }

    /// Hands out fake devices and remembers each link's event sender.
    #[derive(Clone, Default)]
    struct FakeOpener(Arc<Opens>);

    impl FakeOpener {
        fn failing(errors: Vec<InitError>) -> Self {
            let opener = Self::default();
            opener.0.failures.lock().unwrap().extend(errors);
            opener
        }

        fn opens(&self) -> usize {
            self.0.count.load(Ordering::SeqCst)
        }

        fn emit(&self, event: ServerEvent) {
            let events = self.0.events.lock().unwrap();
            events.last().unwrap().send(event).unwrap();
        }
    }

    impl SessionOpener for FakeOpener {
        async fn open(&self, _closing: Arc<AtomicBool>) -> Result<Resources, InitError> {
            self.0.count.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.0.failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            let (events_tx, events) = mpsc::unbounded_channel();
            let (frames_tx, frames) = mpsc::unbounded_channel();
            self.0.events.lock().unwrap().push(events_tx);
            self.0.frames.lock().unwrap().push(frames_tx);
            let seen = self.0.seen.clone();
            Ok(Resources {
                mic: Box::new(FakeMic(seen.clone())),
                playback: Box::new(FakePlayback(seen.clone())),
                link: Box::new(FakeLink(seen)),
                frames,
                events,
                backlog: Backlog::default(),
            })
        }
    }

    fn spawn_manager(opener: FakeOpener, max_attempts: u32) -> VoiceHandle {
        let config = VoiceConfig {
            max_reconnect_attempts: max_attempts,
            ..VoiceConfig::default()
        };
        let (manager, handle) =
            VoiceSessionManager::with_opener(config, Arc::new(TestHost::new()), opener);
        tokio::spawn(manager.run());
        handle
    }

    async fn wait_for(status: &mut watch::Receiver<VoiceStatus>, pred: impl Fn(&VoiceStatus) -> bool) {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if pred(&status.borrow_and_update()) {
                    return;
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .expect("voice status never reached the expected state");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_transport_loss() {
        let opener = FakeOpener::default();
        let handle = spawn_manager(opener.clone(), 5);
        let mut status = handle.subscribe();

        handle.start();
        wait_for(&mut status, |s| s.state == VoiceState::Listening).await;
        assert_eq!(opener.opens(), 1);

        opener.emit(ServerEvent::Closed("1006".into()));
        wait_for(&mut status, |s| s.state == VoiceState::Error).await;
        assert!(status.borrow().active);
        assert_eq!(status.borrow().error.as_deref(), Some("1006"));
        assert!(opener.0.seen.mic_stopped.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(opener.opens(), 1);

        wait_for(&mut status, |s| s.state == VoiceState::Listening).await;
        assert_eq!(opener.opens(), 2);
        assert!(status.borrow().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_cancels_reconnect() {
        let opener = FakeOpener::default();
        let handle = spawn_manager(opener.clone(), 5);
        let mut status = handle.subscribe();

        handle.start();
        wait_for(&mut status, |s| s.state == VoiceState::Listening).await;
        opener.emit(ServerEvent::Closed("1011".into()));
        wait_for(&mut status, |s| s.state == VoiceState::Error).await;

        handle.stop();
        wait_for(&mut status, |s| !s.active).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(opener.opens(), 1);
        assert_eq!(status.borrow().state, VoiceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_ignored_while_active() {
        let opener = FakeOpener::default();
        let handle = spawn_manager(opener.clone(), 5);
        let mut status = handle.subscribe();

        handle.start();
        handle.start();
        wait_for(&mut status, |s| s.state == VoiceState::Listening).await;
        handle.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(opener.opens(), 1);

        handle.stop();
        wait_for(&mut status, |s| !s.active).await;
        assert!(opener.0.seen.link_closed.load(Ordering::SeqCst));
        assert!(opener.0.seen.playback_closed.load(Ordering::SeqCst));
        assert_eq!(opener.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_reconnect_resets_retry_budget() {
        let opener = FakeOpener::default();
        let handle = spawn_manager(opener.clone(), 1);
        let mut status = handle.subscribe();

        handle.start();
        wait_for(&mut status, |s| s.state == VoiceState::Listening).await;
        for expected_opens in [2, 3] {
            opener.emit(ServerEvent::Closed("1006".into()));
            wait_for(&mut status, |s| s.state == VoiceState::Error).await;
            wait_for(&mut status, |s| s.state == VoiceState::Listening).await;
            assert_eq!(opener.opens(), expected_opens);
        }
        assert!(status.borrow().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let failures = (0..10)
            .map(|_| InitError::Transport("refused".into()))
            .collect();
        let opener = FakeOpener::failing(failures);
        let handle = spawn_manager(opener.clone(), 2);
        let mut status = handle.subscribe();

        handle.start();
        wait_for(&mut status, |s| s.active).await;
        wait_for(&mut status, |s| !s.active).await;
        assert_eq!(opener.opens(), 3);
        assert_eq!(status.borrow().state, VoiceState::Idle);
        assert_eq!(status.borrow().error.as_deref(), Some("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_configuration_is_not_retried() {
        let opener = FakeOpener::failing(vec![InitError::Config("no API key".into())]);
        let handle = spawn_manager(opener.clone(), 5);
        let mut status = handle.subscribe();

        handle.start();
        wait_for(&mut status, |s| s.error.is_some() && !s.active).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(opener.opens(), 1);
        assert!(status.borrow().error.as_deref().unwrap().contains("no API key"));
    }

    #[tokio::test]
    async fn test_device_opener_requires_api_key() {
        let config = VoiceConfig {
            api_key: String::new(),
            ..VoiceConfig::default()
        };
        let result = DeviceOpener::new(config)
            .open(Arc::new(AtomicBool::new(false)))
            .await;
        assert!(matches!(result, Err(InitError::Config(_))));
    }
}
