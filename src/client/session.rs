//! Voice session driver.
//!
//! Connects to the relay, owns the capture session and playback queue, and
//! runs one task that multiplexes server frames, captured frames, user signals
//! and the acknowledgement deadline. Controller actions are executed strictly
//! in order; capture is fully stopped, and frames it had already produced are
//! discarded, before the next action runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::controller::{AckKind, Action, ConversationController, ConversationState};
use crate::core::audio::{AudioFrame, CaptureSession, Microphone, PlaybackQueue};
use crate::core::realtime::{
    ClientEvent, DEFAULT_RESPONSE_INSTRUCTIONS, ServerEvent, SessionMode, parse_server_event,
};

/// Default wait for `input_audio_buffer.committed` and `response.done`
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Relay rejected the connection with status {0}")]
    Rejected(u16),

    #[error("Failed to connect to relay: {0}")]
    Connect(String),

    #[error("Voice session task failed: {0}")]
    Task(String),
}

/// Settings for one voice session.
#[derive(Debug, Clone)]
pub struct VoiceSessionConfig {
    /// Relay endpoint, e.g. `ws://localhost:3005/realtime`
    pub url: String,
    /// Relay API secret, sent as a bearer token
    pub token: Option<String>,
    pub mode: SessionMode,
    pub instructions: String,
    pub ack_timeout: Duration,
}

impl VoiceSessionConfig {
    pub fn new(url: impl Into<String>, mode: SessionMode) -> Self {
        Self {
            url: url.into(),
            token: None,
            mode,
            instructions: DEFAULT_RESPONSE_INSTRUCTIONS.to_string(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Relay URL with the session mode as a query parameter.
    pub fn endpoint(&self) -> Result<Url, ClientError> {
        let mut url =
            Url::parse(&self.url).map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::InvalidUrl(format!(
                "expected ws:// or wss://, got {}",
                self.url
            )));
        }
        url.query_pairs_mut().append_pair("mode", self.mode.as_str());
        Ok(url)
    }

    fn build_request(&self) -> Result<http::Request<()>, ClientError> {
        let mut request = self
            .endpoint()?
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = http::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::InvalidUrl(format!("invalid token: {e}")))?;
            request.headers_mut().insert(http::header::AUTHORIZATION, value);
        }
        Ok(request)
    }
}

/// User input to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSignal {
    /// Push-to-talk key down
    Press,
    /// Push-to-talk key up
    Release,
    /// Close the session
    Close,
}

/// Observable progress of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConversationState),
    Transcript(String),
    Error(String),
}

/// What happened during a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionReport {
    pub transcript: String,
    pub errors: Vec<String>,
    pub frames_sent: u64,
    pub audio_chunks_received: u64,
    pub unknown_events: u64,
}

/// Entry point for starting voice sessions.
pub struct VoiceSession;

impl VoiceSession {
    /// Connect to the relay and start the session task.
    pub async fn connect(
        config: VoiceSessionConfig,
        microphone: Arc<dyn Microphone>,
        playback: PlaybackQueue,
    ) -> Result<VoiceSessionHandle, ClientError> {
        let request = config.build_request()?;
        let (socket, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) => {
                    ClientError::Rejected(response.status().as_u16())
                }
                other => ClientError::Connect(other.to_string()),
            })?;
        info!(url = %config.url, mode = %config.mode, status = %response.status(), "Voice session connected");

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let controller = ConversationController::new(config.mode, config.instructions.clone());
        let driver = SessionDriver {
            reported_state: controller.state(),
            controller,
            capture: CaptureSession::new(microphone),
            socket: Some(socket),
            frame_tx,
            frame_rx,
            playback,
            events: event_tx,
            ack_deadline: None,
            ack_timeout: config.ack_timeout,
            report: SessionReport::default(),
        };

        Ok(VoiceSessionHandle {
            signals: signal_tx,
            events: event_rx,
            task: tokio::spawn(driver.run(signal_rx)),
        })
    }
}

/// Control surface of a running session.
pub struct VoiceSessionHandle {
    signals: mpsc::UnboundedSender<UserSignal>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<SessionReport>,
}

impl VoiceSessionHandle {
    pub fn press(&self) {
        let _ = self.signals.send(UserSignal::Press);
    }

    pub fn release(&self) {
        let _ = self.signals.send(UserSignal::Release);
    }

    pub fn close(&self) {
        let _ = self.signals.send(UserSignal::Close);
    }

    /// Next progress event; `None` once the session task has ended.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Wait for the session to end on its own.
    pub async fn join(self) -> Result<SessionReport, ClientError> {
        self.task
            .await
            .map_err(|e| ClientError::Task(e.to_string()))
    }

    /// Close the session and wait for its report.
    pub async fn finish(self) -> Result<SessionReport, ClientError> {
        self.close();
        self.join().await
    }
}

struct SessionDriver {
    controller: ConversationController,
    /// Last state sent as `SessionEvent::StateChanged`
    reported_state: ConversationState,
    capture: CaptureSession,
    socket: Option<RelaySocket>,
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
    frame_rx: mpsc::UnboundedReceiver<AudioFrame>,
    playback: PlaybackQueue,
    events: mpsc::UnboundedSender<SessionEvent>,
    ack_deadline: Option<(Instant, AckKind)>,
    ack_timeout: Duration,
    report: SessionReport,
}

enum Step {
    Continue,
    Finish,
}

impl SessionDriver {
    async fn run(mut self, mut signals: mpsc::UnboundedReceiver<UserSignal>) -> SessionReport {
        let actions = self.controller.on_session_open();
        self.apply(actions).await;

        loop {
            let deadline = self.ack_deadline.map(|(at, _)| at);
            let step = tokio::select! {
                msg = next_message(&mut self.socket) => self.handle_server_message(msg).await,
                Some(frame) = self.frame_rx.recv() => {
                    self.handle_frame(frame).await;
                    Step::Continue
                }
                signal = signals.recv() => self.handle_signal(signal.unwrap_or(UserSignal::Close)).await,
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    let kind = self.ack_deadline.take().map(|(_, kind)| kind);
                    if let Some(kind) = kind {
                        let actions = self.controller.on_ack_timeout(kind);
                        self.apply(actions).await;
                    }
                    Step::Continue
                }
            };

            if let Step::Finish = step {
                break;
            }
        }

        self.capture.stop().await;
        if let Some(mut socket) = self.socket.take()
            && let Err(e) = socket.close(None).await
        {
            debug!(error = %e, "Relay close handshake failed");
        }
        self.playback.wait_idle().await;

        self.report.transcript = self.controller.transcript().to_string();
        info!(
            frames_sent = self.report.frames_sent,
            audio_chunks = self.report.audio_chunks_received,
            errors = self.report.errors.len(),
            "Voice session finished"
        );
        self.report
    }

    async fn handle_server_message(
        &mut self,
        msg: Option<Result<Message, tungstenite::Error>>,
    ) -> Step {
        match msg {
            Some(Ok(Message::Text(text))) => {
                match parse_server_event(&text) {
                    Ok(event) => {
                        match event {
                            ServerEvent::Unknown => self.report.unknown_events += 1,
                            ServerEvent::AudioDelta { .. } => self.report.audio_chunks_received += 1,
                            _ => {}
                        }
                        let actions = self.controller.on_server_event(&event);
                        self.apply(actions).await;
                    }
                    Err(e) => warn!(error = %e, "Malformed event from relay"),
                }
                Step::Continue
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(bytes = data.len(), "Ignoring binary frame from relay");
                Step::Continue
            }
            Some(Ok(Message::Close(frame))) => {
                info!(frame = ?frame, "Relay closed the session");
                self.socket = None;
                self.close_session().await
            }
            Some(Ok(_)) => Step::Continue,
            Some(Err(e)) => {
                error!(error = %e, "Relay connection error");
                self.socket = None;
                self.record_error(format!("Relay connection error: {e}"));
                self.close_session().await
            }
            None => {
                info!("Relay connection ended");
                self.socket = None;
                self.close_session().await
            }
        }
    }

    async fn handle_frame(&mut self, frame: AudioFrame) {
        if let Some(event) = self.controller.on_audio_frame(&frame) {
            if self.send(&event).await {
                self.report.frames_sent += 1;
            }
        } else {
            debug!(sequence = frame.sequence, "Dropping frame outside capture");
        }
    }

    async fn handle_signal(&mut self, signal: UserSignal) -> Step {
        debug!(signal = ?signal, "User signal");
        let actions = match signal {
            UserSignal::Press => self.controller.on_user_press(),
            UserSignal::Release => self.controller.on_user_release(),
            UserSignal::Close => return self.close_session().await,
        };
        self.apply(actions).await;
        Step::Continue
    }

    async fn close_session(&mut self) -> Step {
        let actions = self.controller.on_close();
        self.apply(actions).await;
        Step::Finish
    }

    /// Execute controller actions in order.
    async fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::StartCapture => {
                    let frames = self.frame_tx.clone();
                    let started = self.capture.start(Arc::new(move |frame| {
                        let _ = frames.send(frame);
                    }));
                    if let Err(e) = started {
                        warn!(error = %e, "Failed to start capture");
                        for follow_up in self.controller.on_capture_failed(&e.to_string()).into_iter().rev() {
                            queue.push_front(follow_up);
                        }
                    }
                }
                Action::StopCapture => {
                    self.capture.stop().await;
                    // Frames captured before the stop must not reach the relay
                    let mut discarded = 0usize;
                    while self.frame_rx.try_recv().is_ok() {
                        discarded += 1;
                    }
                    if discarded > 0 {
                        debug!(discarded, "Discarded frames buffered before capture stop");
                    }
                }
                Action::Send(event) => {
                    self.send(&event).await;
                }
                Action::Play(delta) => self.playback.enqueue(delta),
                Action::TranscriptChanged(transcript) => {
                    self.emit(SessionEvent::Transcript(transcript));
                }
                Action::ArmAckTimer(kind) => {
                    self.ack_deadline = Some((Instant::now() + self.ack_timeout, kind));
                }
                Action::DisarmAckTimer => self.ack_deadline = None,
                Action::ReportError(message) => self.record_error(message),
            }
        }

        self.report_state();
    }

    /// Emit `StateChanged` if the controller moved since the last report.
    fn report_state(&mut self) {
        let state = self.controller.state();
        if state != self.reported_state {
            self.reported_state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    async fn send(&mut self, event: &ClientEvent) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            debug!(event_type = event.event_type(), "Relay closed, not sending");
            return false;
        };
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize client event");
                return false;
            }
        };
        match socket.send(Message::Text(json.into())).await {
            Ok(()) => {
                debug!(event_type = event.event_type(), "Sent client event");
                true
            }
            Err(e) => {
                warn!(error = %e, event_type = event.event_type(), "Failed to send client event");
                false
            }
        }
    }

    fn record_error(&mut self, message: String) {
        self.emit(SessionEvent::Error(message.clone()));
        self.report.errors.push(message);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_message(
    socket: &mut Option<RelaySocket>,
) -> Option<Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_adds_mode() {
        let config = VoiceSessionConfig::new("ws://localhost:3005/realtime", SessionMode::Auto);
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "ws://localhost:3005/realtime?mode=auto"
        );
    }

    #[test]
    fn test_endpoint_rejects_http() {
        let config = VoiceSessionConfig::new("http://localhost:3005/realtime", SessionMode::Manual);
        assert!(matches!(config.endpoint(), Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn test_request_carries_token() {
        let mut config = VoiceSessionConfig::new("ws://localhost:3005/realtime", SessionMode::Manual);
        config.token = Some("relay-secret".to_string());

        let request = config.build_request().unwrap();
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer relay-secret"
        );
        assert_eq!(request.uri().query(), Some("mode=manual"));
    }

    #[test]
    fn test_config_defaults() {
        let config = VoiceSessionConfig::new("ws://localhost:3005/realtime", SessionMode::Manual);
        assert_eq!(config.ack_timeout, DEFAULT_ACK_TIMEOUT);
        assert_eq!(config.instructions, DEFAULT_RESPONSE_INSTRUCTIONS);
        assert!(config.token.is_none());
    }

    fn offline_driver(
        mode: SessionMode,
    ) -> (SessionDriver, mpsc::UnboundedReceiver<SessionEvent>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let controller = ConversationController::new(mode, "go");
        let driver = SessionDriver {
            reported_state: controller.state(),
            controller,
            capture: CaptureSession::new(Arc::new(crate::core::audio::ChannelMicrophone::new())),
            socket: None,
            frame_tx,
            frame_rx,
            playback: PlaybackQueue::new(
                Arc::new(crate::client::io::NullOutput),
                crate::core::realtime::REALTIME_SAMPLE_RATE,
            ),
            events: event_tx,
            ack_deadline: None,
            ack_timeout: Duration::from_secs(5),
            report: SessionReport::default(),
        };
        (driver, event_rx)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_state_changes_reported_once_each() {
        let (mut driver, mut events) = offline_driver(SessionMode::Manual);

        driver.handle_signal(UserSignal::Press).await;
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::StateChanged(ConversationState::Capturing)]
        );

        // A second press changes nothing and reports nothing
        driver.handle_signal(UserSignal::Press).await;
        assert!(drain(&mut events).is_empty());

        driver.handle_signal(UserSignal::Release).await;
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::StateChanged(ConversationState::AwaitingResponse)]
        );
        assert!(matches!(driver.ack_deadline, Some((_, AckKind::Response))));

        assert!(matches!(
            driver.handle_signal(UserSignal::Close).await,
            Step::Finish
        ));
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::StateChanged(ConversationState::Idle)]
        );
        assert!(driver.ack_deadline.is_none());
    }

    #[tokio::test]
    async fn test_auto_session_open_reports_capturing() {
        let (mut driver, mut events) = offline_driver(SessionMode::Auto);

        let actions = driver.controller.on_session_open();
        driver.apply(actions).await;
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::StateChanged(ConversationState::Capturing)]
        );

        driver.capture.stop().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config =
            VoiceSessionConfig::new(format!("ws://127.0.0.1:{port}/realtime"), SessionMode::Auto);
        let microphone = Arc::new(crate::core::audio::ChannelMicrophone::new());
        let playback = PlaybackQueue::new(
            Arc::new(crate::client::io::NullOutput),
            crate::core::realtime::REALTIME_SAMPLE_RATE,
        );

        let result = VoiceSession::connect(config, microphone, playback).await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
    }
}
