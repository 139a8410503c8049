//! Shared test support: a scripted realtime upstream and a relay server
//! bound to an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use voice_relay_gateway::{ServerConfig, build_router, state::AppState};

/// Appends the mock sees before it reports end of speech
pub const APPENDS_BEFORE_SPEECH_STOP: usize = 3;

/// Transcript the mock answers every response with
pub const MOCK_TRANSCRIPT: &str = "Hello there";

/// Something the mock upstream observed.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Handshake {
        path_and_query: String,
        authorization: Option<String>,
        beta: Option<String>,
    },
    Text(String),
    Binary(Vec<u8>),
    Closed,
}

impl UpstreamEvent {
    /// `type` of a text event, if it is JSON with one.
    pub fn event_type(&self) -> Option<String> {
        match self {
            Self::Text(text) => serde_json::from_str::<Value>(text)
                .ok()?
                .get("type")?
                .as_str()
                .map(str::to_string),
            _ => None,
        }
    }
}

pub struct MockUpstream {
    /// Base URL to configure as the realtime endpoint
    pub url: String,
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

impl MockUpstream {
    /// Next observed event, failing the test after a few seconds.
    pub async fn next(&mut self) -> UpstreamEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for upstream event")
            .expect("mock upstream stopped")
    }

    /// Skip events until one with the given `type` arrives.
    pub async fn expect_type(&mut self, event_type: &str) -> UpstreamEvent {
        loop {
            let event = self.next().await;
            if event.event_type().as_deref() == Some(event_type) {
                return event;
            }
        }
    }

    /// Skip events until the upstream connection closes.
    pub async fn expect_closed(&mut self) {
        while self.next().await != UpstreamEvent::Closed {}
    }
}

/// Start a scripted realtime upstream.
///
/// Replies like the realtime API does for a single conversation: VAD events
/// after a few appends, an acknowledgement for commits and a short audio
/// response for `response.create`. Events typed `test.*` and binary frames
/// are echoed back, `test.close` makes the mock close the connection.
pub async fn spawn_mock_upstream() -> MockUpstream {
    spawn_mock_upstream_with(None, Duration::ZERO).await
}

/// Start a mock upstream that refuses every handshake with `status`.
pub async fn spawn_rejecting_upstream(status: u16) -> MockUpstream {
    spawn_mock_upstream_with(Some(status), Duration::ZERO).await
}

/// Start a mock upstream that accepts TCP right away but waits `delay`
/// before answering the WebSocket handshake.
pub async fn spawn_slow_upstream(delay: Duration) -> MockUpstream {
    spawn_mock_upstream_with(None, delay).await
}

async fn spawn_mock_upstream_with(reject_with: Option<u16>, handshake_delay: Duration) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(handshake_delay).await;
                let _ = handle_upstream_connection(stream, tx, reject_with).await;
            });
        }
    });

    MockUpstream {
        url: format!("ws://{addr}/v1/realtime"),
        events: rx,
    }
}

async fn handle_upstream_connection(
    stream: TcpStream,
    tx: mpsc::UnboundedSender<UpstreamEvent>,
    reject_with: Option<u16>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handshake_tx = tx.clone();
    let callback = move |request: &Request, response: Response| {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let _ = handshake_tx.send(UpstreamEvent::Handshake {
            path_and_query: request
                .uri()
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_default(),
            authorization: header("authorization"),
            beta: header("openai-beta"),
        });
        match reject_with {
            Some(status) => {
                let error: ErrorResponse = http::Response::builder()
                    .status(status)
                    .body(Some("rejected".to_string()))
                    .unwrap();
                Err(error)
            }
            None => Ok(response),
        }
    };

    let ws = accept_hdr_async(stream, callback).await?;
    let (mut write, mut read) = ws.split();

    write
        .send(Message::Text(
            json!({"type": "session.created", "session": {"id": "sess_mock"}})
                .to_string()
                .into(),
        ))
        .await?;

    let mut appends = 0usize;

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => {
                let text = text.to_string();
                let _ = tx.send(UpstreamEvent::Text(text.clone()));
                let event_type = serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_default();

                let replies: Vec<Value> = match event_type.as_str() {
                    "input_audio_buffer.append" => {
                        appends += 1;
                        if appends == APPENDS_BEFORE_SPEECH_STOP {
                            vec![
                                json!({"type": "input_audio_buffer.speech_started", "audio_start_ms": 0}),
                                json!({"type": "input_audio_buffer.speech_stopped", "audio_end_ms": 250, "item_id": "item_1"}),
                            ]
                        } else {
                            Vec::new()
                        }
                    }
                    "input_audio_buffer.commit" => {
                        vec![json!({"type": "input_audio_buffer.committed", "item_id": "item_1"})]
                    }
                    "response.create" => response_script(),
                    "test.close" => {
                        write.send(Message::Close(None)).await?;
                        break;
                    }
                    t if t.starts_with("test.") => {
                        write.send(Message::Text(text.into())).await?;
                        Vec::new()
                    }
                    _ => Vec::new(),
                };

                for reply in replies {
                    write.send(Message::Text(reply.to_string().into())).await?;
                }
            }
            Message::Binary(data) => {
                let _ = tx.send(UpstreamEvent::Binary(data.to_vec()));
                write.send(Message::Binary(data)).await?;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = tx.send(UpstreamEvent::Closed);
    Ok(())
}

/// Events the mock sends for one response.
fn response_script() -> Vec<Value> {
    use base64::Engine;
    // 10 ms of a quiet square wave
    let pcm: Vec<u8> = (0..240i16)
        .flat_map(|i| if i % 20 < 10 { 1000i16 } else { -1000i16 }.to_le_bytes())
        .collect();
    let audio = base64::engine::general_purpose::STANDARD.encode(pcm);

    vec![
        json!({"type": "response.created", "response": {"id": "resp_1"}}),
        json!({"type": "response.audio.delta", "response_id": "resp_1", "delta": audio}),
        json!({"type": "response.audio_transcript.delta", "delta": "Hello"}),
        json!({"type": "response.audio.done"}),
        json!({"type": "response.audio_transcript.done", "transcript": MOCK_TRANSCRIPT}),
        json!({"type": "response.done", "response": {"id": "resp_1", "status": "completed"}}),
    ]
}

/// Configuration pointing the relay at `upstream_url`, rate limiting off.
pub fn relay_config(upstream_url: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.host = "127.0.0.1".to_string();
    config.realtime_url = upstream_url.to_string();
    config.openai_api_key = Some("sk-test".to_string());
    config.realtime_connect_timeout_seconds = 2;
    config.rate_limit_requests_per_second = 100_000;
    config
}

/// Serve the full router on an ephemeral port.
pub async fn spawn_relay(config: ServerConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState::new(config).await);

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}

/// Wait until the upstream has been initialized for a new relay session.
pub async fn wait_for_upstream_session(upstream: &mut MockUpstream) {
    upstream.expect_type("session.update").await;
    // The relay marks the upstream open right after the init frame is written
    tokio::time::sleep(Duration::from_millis(50)).await;
}
