//! Conversation controller.
//!
//! A pure state machine over session events. Every input returns the ordered
//! list of [`Action`]s the driver must perform; nothing here touches the
//! network, the microphone or the speaker. The driver executes actions in
//! order and finishes each one before starting the next, which is what makes
//! "capture is stopped before the next send" hold.

use std::fmt;

use tracing::{debug, info, warn};

use crate::core::audio::AudioFrame;
use crate::core::realtime::{ClientEvent, ServerEvent, SessionMode};

/// Where the conversation is in a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    #[default]
    Idle,
    Capturing,
    AwaitingCommit,
    AwaitingResponse,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::AwaitingCommit => "awaiting_commit",
            Self::AwaitingResponse => "awaiting_response",
        })
    }
}

/// Acknowledgement the controller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// `input_audio_buffer.committed`
    Commit,
    /// `response.done`
    Response,
}

impl AckKind {
    fn awaited_state(self) -> ConversationState {
        match self {
            Self::Commit => ConversationState::AwaitingCommit,
            Self::Response => ConversationState::AwaitingResponse,
        }
    }

    fn event_name(self) -> &'static str {
        match self {
            Self::Commit => "input_audio_buffer.committed",
            Self::Response => "response.done",
        }
    }
}

/// Side effect requested by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartCapture,
    StopCapture,
    Send(ClientEvent),
    /// Base64 PCM chunk for the playback queue
    Play(String),
    /// Full transcript after an update
    TranscriptChanged(String),
    /// (Re)arm the acknowledgement deadline
    ArmAckTimer(AckKind),
    DisarmAckTimer,
    ReportError(String),
}

/// State machine for one voice session.
#[derive(Debug)]
pub struct ConversationController {
    mode: SessionMode,
    state: ConversationState,
    /// Microphone is running. In auto mode it stays on for the whole turn.
    capturing: bool,
    transcript: String,
    instructions: String,
}

impl ConversationController {
    pub fn new(mode: SessionMode, instructions: impl Into<String>) -> Self {
        Self {
            mode,
            state: ConversationState::Idle,
            capturing: false,
            transcript: String::new(),
            instructions: instructions.into(),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// The relay connection is open. Auto mode starts listening immediately.
    pub fn on_session_open(&mut self) -> Vec<Action> {
        if self.mode == SessionMode::Auto && self.state == ConversationState::Idle {
            self.transition(ConversationState::Capturing);
            return self.start_capture();
        }
        Vec::new()
    }

    /// Push-to-talk key pressed.
    pub fn on_user_press(&mut self) -> Vec<Action> {
        if self.mode != SessionMode::Manual || self.state != ConversationState::Idle {
            debug!(state = %self.state, mode = %self.mode, "Ignoring press");
            return Vec::new();
        }
        self.transition(ConversationState::Capturing);
        self.start_capture()
    }

    /// Push-to-talk key released: stop capture, then ask for a response
    /// directly, without a commit round trip.
    pub fn on_user_release(&mut self) -> Vec<Action> {
        if self.mode != SessionMode::Manual || self.state != ConversationState::Capturing {
            debug!(state = %self.state, mode = %self.mode, "Ignoring release");
            return Vec::new();
        }
        let mut actions = self.stop_capture();
        self.transition(ConversationState::AwaitingResponse);
        actions.push(Action::Send(ClientEvent::response_create(&self.instructions)));
        actions.push(Action::ArmAckTimer(AckKind::Response));
        actions
    }

    /// Wrap a captured frame for sending, if frames are currently wanted.
    pub fn on_audio_frame(&self, frame: &AudioFrame) -> Option<ClientEvent> {
        if self.state != ConversationState::Capturing || !self.capturing {
            return None;
        }
        let audio = frame.to_transport_text();
        Some(match self.mode {
            SessionMode::Auto => ClientEvent::audio_append(audio),
            SessionMode::Manual => ClientEvent::user_audio_item(audio),
        })
    }

    pub fn on_server_event(&mut self, event: &ServerEvent) -> Vec<Action> {
        match event {
            // Playback is independent of the turn state
            ServerEvent::AudioDelta { delta } => vec![Action::Play(delta.clone())],

            ServerEvent::SpeechStopped { .. } => {
                if self.mode == SessionMode::Auto && self.state == ConversationState::Capturing {
                    self.transition(ConversationState::AwaitingCommit);
                    vec![
                        Action::Send(ClientEvent::InputAudioBufferCommit),
                        Action::ArmAckTimer(AckKind::Commit),
                    ]
                } else {
                    Vec::new()
                }
            }

            ServerEvent::InputAudioBufferCommitted { .. } => {
                if self.state == ConversationState::AwaitingCommit {
                    self.transition(ConversationState::AwaitingResponse);
                    vec![
                        Action::Send(ClientEvent::response_create(&self.instructions)),
                        Action::ArmAckTimer(AckKind::Response),
                    ]
                } else {
                    Vec::new()
                }
            }

            ServerEvent::ResponseDone { .. } => {
                if self.state != ConversationState::AwaitingResponse {
                    return Vec::new();
                }
                match self.mode {
                    SessionMode::Auto => {
                        self.transition(ConversationState::Capturing);
                        let mut actions = vec![Action::DisarmAckTimer];
                        if !self.capturing {
                            actions.extend(self.start_capture());
                        }
                        actions
                    }
                    SessionMode::Manual => {
                        self.transition(ConversationState::Idle);
                        vec![Action::DisarmAckTimer]
                    }
                }
            }

            ServerEvent::TextDelta { delta } => self.update_transcript(delta, false),
            ServerEvent::AudioTranscriptDone { transcript } => {
                self.update_transcript(transcript, true)
            }

            ServerEvent::Error { error } => {
                warn!(message = %error.message(), "Realtime error event");
                self.reset(Some(error.message().to_string()))
            }

            other => {
                debug!(event_type = %other.event_type(), "No transition for event");
                Vec::new()
            }
        }
    }

    /// The acknowledgement deadline armed for `kind` expired.
    pub fn on_ack_timeout(&mut self, kind: AckKind) -> Vec<Action> {
        if self.state != kind.awaited_state() {
            return Vec::new();
        }
        warn!(awaiting = kind.event_name(), "Acknowledgement timed out");
        self.reset(Some(format!("Timed out waiting for {}", kind.event_name())))
    }

    /// Capture could not be started; the microphone is not running.
    pub fn on_capture_failed(&mut self, reason: &str) -> Vec<Action> {
        self.capturing = false;
        self.reset(Some(format!("Audio capture failed: {reason}")))
    }

    /// The session is closing, from either side.
    pub fn on_close(&mut self) -> Vec<Action> {
        self.reset(None)
    }

    fn reset(&mut self, error: Option<String>) -> Vec<Action> {
        let mut actions = self.stop_capture();
        actions.push(Action::DisarmAckTimer);
        self.transition(ConversationState::Idle);
        if let Some(error) = error {
            actions.push(Action::ReportError(error));
        }
        actions
    }

    fn start_capture(&mut self) -> Vec<Action> {
        self.capturing = true;
        vec![Action::StartCapture]
    }

    fn stop_capture(&mut self) -> Vec<Action> {
        if self.capturing {
            self.capturing = false;
            vec![Action::StopCapture]
        } else {
            Vec::new()
        }
    }

    /// Manual mode accumulates; auto mode shows the latest payload only.
    fn update_transcript(&mut self, text: &str, finished: bool) -> Vec<Action> {
        match self.mode {
            SessionMode::Manual => {
                self.transcript.push_str(text);
                if finished {
                    self.transcript.push('\n');
                }
            }
            SessionMode::Auto => {
                self.transcript.clear();
                self.transcript.push_str(text);
            }
        }
        vec![Action::TranscriptChanged(self.transcript.clone())]
    }

    fn transition(&mut self, next: ConversationState) {
        if self.state != next {
            info!(from = %self.state, to = %next, mode = %self.mode, "Conversation state change");
            self.state = next;
        }
    }
}
