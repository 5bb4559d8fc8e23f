//! Gemini Live bidirectional session over WebSocket.
//!
//! `LiveClient::connect` performs the handshake (setup → setupComplete) and
//! then splits the socket: a writer task drains an outgoing queue, a reader
//! task turns server frames into `ServerEvent`s on an unbounded channel.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::VoiceConfig;

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ToolCall(Vec<FunctionCall>),
    /// Base64 PCM16 at the output rate.
    Audio(String),
    Transcription(String),
    TurnComplete,
    Interrupted,
    Error(String),
    Closed(String),
}

/// The sending half of a live session.
pub trait LiveLink: Send {
    fn send_audio(&self, base64_pcm: String) -> Result<(), String>;
    fn send_tool_response(&self, id: &str, name: &str, result: &str) -> Result<(), String>;
    fn close(&mut self);
}

pub fn setup_message(config: &VoiceConfig, tools: Value) -> Value {
    json!({
        "setup": {
            "model": config.model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": config.voice_name }
                    }
                }
            },
            "systemInstruction": { "parts": [{ "text": config.system_prompt }] },
            "tools": [{ "functionDeclarations": tools }],
            "inputAudioTranscription": {}
        }
    })
}

pub fn audio_message(input_sample_rate: u32, base64_pcm: &str) -> Value {
    json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": format!("audio/pcm;rate={input_sample_rate}"),
                "data": base64_pcm
            }]
        }
    })
}

pub fn tool_response_message(id: &str, name: &str, result: &str) -> Value {
    json!({
        "toolResponse": {
            "functionResponses": [{
                "id": id,
                "name": name,
                "response": { "result": result }
            }]
        }
    })
}

/// Split one server message into events, in the order the session should
/// handle them: tool calls first, then content.
pub fn parse_server_message(msg: &Value) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    if let Some(calls) = msg.pointer("/toolCall/functionCalls").and_then(Value::as_array) {
        let calls: Vec<FunctionCall> = calls
            .iter()
            .map(|c| FunctionCall {
                id: c.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                name: c.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                args: c.get("args").cloned().unwrap_or_else(|| json!({})),
            })
            .collect();
        if !calls.is_empty() {
            events.push(ServerEvent::ToolCall(calls));
        }
    }

    if let Some(content) = msg.get("serverContent") {
        if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
            events.push(ServerEvent::Interrupted);
        }
        if let Some(text) = content
            .pointer("/inputTranscription/text")
            .and_then(Value::as_str)
        {
            events.push(ServerEvent::Transcription(text.to_string()));
        }
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(Value::as_array) {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(Value::as_str) {
                    events.push(ServerEvent::Audio(data.to_string()));
                }
            }
        }
        if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(go_away) = msg.get("goAway") {
        let left = go_away
            .get("timeLeft")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        events.push(ServerEvent::Closed(format!("server going away ({left})")));
    }

    if let Some(error) = msg.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        events.push(ServerEvent::Error(message));
    }

    events
}

fn frame_json(message: &Message) -> Option<Result<Value, String>> {
    let bytes: &[u8] = match message {
        Message::Text(text) => text.as_bytes(),
        Message::Binary(data) => data,
        _ => return None,
    };
    Some(serde_json::from_slice(bytes).map_err(|e| format!("Bad server frame: {e}")))
}

pub struct LiveClient {
    outgoing: UnboundedSender<Message>,
    input_sample_rate: u32,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl LiveClient {
    /// Open the socket, send setup and wait for `setupComplete`.
    pub async fn connect(
        config: &VoiceConfig,
        tools: Value,
    ) -> Result<(Self, UnboundedReceiver<ServerEvent>), String> {
        if config.api_key.is_empty() {
            return Err("No API key configured (voice.api_key or GEMINI_API_KEY)".into());
        }
        let url = format!("{}?key={}", config.endpoint, config.api_key);

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| format!("Failed to connect live session: {e}"))?;
        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Text(setup_message(config, tools).to_string()))
            .await
            .map_err(|e| format!("Failed to send setup: {e}"))?;

        let handshake = async {
            while let Some(frame) = stream.next().await {
                let frame = frame.map_err(|e| format!("Live session read error: {e}"))?;
                if let Message::Close(reason) = &frame {
                    return Err(format!("Live session closed during setup: {reason:?}"));
                }
                match frame_json(&frame) {
                    Some(Ok(msg)) if msg.get("setupComplete").is_some() => return Ok(()),
                    Some(Ok(msg)) => {
                        if let Some(ServerEvent::Error(e)) = parse_server_message(&msg).pop() {
                            return Err(format!("Live session rejected setup: {e}"));
                        }
                    }
                    Some(Err(e)) => warn!("{e}"),
                    None => {}
                }
            }
            Err("Live session ended before setup completed".to_string())
        };
        tokio::time::timeout(SETUP_TIMEOUT, handshake)
            .await
            .map_err(|_| "Timed out waiting for setupComplete".to_string())??;
        info!("Live session ready ({})", config.model);

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("Live session write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("{} {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed".into());
                    }
                    Some(Ok(frame)) => match frame_json(&frame) {
                        Some(Ok(msg)) => {
                            for event in parse_server_message(&msg) {
                                if events_tx.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => warn!("{e}"),
                        None => {}
                    },
                    Some(Err(e)) => {
                        let _ = events_tx.send(ServerEvent::Error(e.to_string()));
                        break "read error".into();
                    }
                    None => break "stream ended".into(),
                }
            };
            let _ = events_tx.send(ServerEvent::Closed(reason));
        });

        Ok((
            Self {
                outgoing,
                input_sample_rate: config.input_sample_rate,
                writer: Some(writer),
                reader: Some(reader),
            },
            events_rx,
        ))
    }

    fn send_json(&self, value: Value) -> Result<(), String> {
        self.outgoing
            .send(Message::Text(value.to_string()))
            .map_err(|_| "Live session is closed".to_string())
    }
}

impl LiveLink for LiveClient {
    fn send_audio(&self, base64_pcm: String) -> Result<(), String> {
        self.send_json(audio_message(self.input_sample_rate, &base64_pcm))
    }

    fn send_tool_response(&self, id: &str, name: &str, result: &str) -> Result<(), String> {
        self.send_json(tool_response_message(id, name, result))
    }

    fn close(&mut self) {
        let _ = self.outgoing.send(Message::Close(None));
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // The writer exits after flushing the close frame
        self.writer.take();
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_carries_tools_voice_and_transcription() {
        let config = VoiceConfig::default();
        let setup = setup_message(&config, json!([{"name": "close_assistant"}]));
        assert_eq!(setup["setup"]["model"], config.model.as_str());
        assert_eq!(setup["setup"]["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            setup.pointer("/setup/generationConfig/speechConfig/voiceConfig/prebuiltVoiceConfig/voiceName"),
            Some(&json!("Kore"))
        );
        assert_eq!(
            setup.pointer("/setup/tools/0/functionDeclarations/0/name"),
            Some(&json!("close_assistant"))
        );
        assert!(setup["setup"]["inputAudioTranscription"].is_object());
    }

    #[test]
    fn test_audio_message_format() {
        let msg = audio_message(16000, "AAAA");
        assert_eq!(
            msg,
            json!({"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "AAAA"}]}})
        );
    }

    #[test]
    fn test_tool_response_format() {
        let msg = tool_response_message("c1", "delete_task", "Tarefa apagada");
        assert_eq!(
            msg.pointer("/toolResponse/functionResponses/0"),
            Some(&json!({"id": "c1", "name": "delete_task", "response": {"result": "Tarefa apagada"}}))
        );
    }

    #[test]
    fn test_parse_tool_call() {
        let msg = json!({"toolCall": {"functionCalls": [
            {"id": "a", "name": "add_task", "args": {"title": "x"}},
            {"id": "b", "name": "close_assistant"}
        ]}});
        let events = parse_server_message(&msg);
        assert_eq!(events.len(), 1);
        let ServerEvent::ToolCall(calls) = &events[0] else {
            panic!("expected tool call");
        };
        assert_eq!(calls[0].name, "add_task");
        assert_eq!(calls[0].args["title"], "x");
        assert_eq!(calls[1].args, json!({}));
    }

    #[test]
    fn test_parse_server_content() {
        let msg = json!({"serverContent": {
            "inputTranscription": {"text": "oi alba"},
            "modelTurn": {"parts": [
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                {"text": "ignored"},
                {"inlineData": {"data": "BBB="}}
            ]},
            "turnComplete": true
        }});
        assert_eq!(
            parse_server_message(&msg),
            vec![
                ServerEvent::Transcription("oi alba".into()),
                ServerEvent::Audio("AAA=".into()),
                ServerEvent::Audio("BBB=".into()),
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_parse_interrupted_and_go_away() {
        let events = parse_server_message(&json!({"serverContent": {"interrupted": true}}));
        assert_eq!(events, vec![ServerEvent::Interrupted]);

        let events = parse_server_message(&json!({"goAway": {"timeLeft": "5s"}}));
        assert!(matches!(&events[..], [ServerEvent::Closed(r)] if r.contains("5s")));
    }

    #[test]
    fn test_binary_frames_are_json_too() {
        let frame = Message::Binary(br#"{"setupComplete":{}}"#.to_vec());
        let value = frame_json(&frame).unwrap().unwrap();
        assert!(value.get("setupComplete").is_some());
        assert!(frame_json(&Message::Ping(Vec::new())).is_none());
    }
}
