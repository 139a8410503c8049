//! Realtime protocol events.
//!
//! Every event is a JSON object whose `type` field determines the payload
//! shape. Client events are produced by the conversation controller and the
//! relay; server events are consumed by the controller.
//!
//! Client events:
//! - session.update
//! - input_audio_buffer.append
//! - input_audio_buffer.commit
//! - conversation.item.create
//! - response.create
//!
//! Server events acted upon:
//! - input_audio_buffer.speech_stopped
//! - input_audio_buffer.committed
//! - response.audio.delta
//! - response.text.delta
//! - response.audio_transcript.done
//! - response.done
//! - error

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::config::{Modality, PCM16_AUDIO_FORMAT, REALTIME_SAMPLE_RATE, SessionMode};

// =============================================================================
// Session Configuration
// =============================================================================

/// Session settings sent once when the upstream connection opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub sample_rate: u32,
    /// `null` disables server-side turn detection.
    pub turn_detection: Option<TurnDetection>,
}

impl SessionConfig {
    /// PCM16 session for the given mode.
    ///
    /// Manual sessions disable turn detection; auto sessions use server VAD
    /// but leave response creation to the client.
    pub fn for_mode(model: &str, voice: &str, mode: SessionMode) -> Self {
        let turn_detection = match mode {
            SessionMode::Manual => None,
            SessionMode::Auto => Some(TurnDetection::ServerVad {
                threshold: None,
                prefix_padding_ms: None,
                silence_duration_ms: None,
                create_response: Some(false),
            }),
        };
        Self {
            model: model.to_string(),
            voice: voice.to_string(),
            input_audio_format: PCM16_AUDIO_FORMAT.to_string(),
            output_audio_format: PCM16_AUDIO_FORMAT.to_string(),
            sample_rate: REALTIME_SAMPLE_RATE,
            turn_detection,
        }
    }
}

/// Turn detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    #[serde(rename = "server_vad")]
    ServerVad {
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        create_response: Option<bool>,
    },
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Conversation item carried by `conversation.item.create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// A user message holding one chunk of base64 PCM16 audio.
    pub fn user_audio(audio: String) -> Self {
        Self {
            item_type: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart {
                content_type: "input_audio".to_string(),
                audio: Some(audio),
                text: None,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Response configuration for `response.create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseConfig {
    pub modalities: Vec<Modality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// =============================================================================
// Client Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Append base64 audio to the server's input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseConfig },
}

impl ClientEvent {
    pub fn audio_append(audio: String) -> Self {
        ClientEvent::InputAudioBufferAppend { audio }
    }

    pub fn user_audio_item(audio: String) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_audio(audio),
        }
    }

    /// Request a spoken and written response.
    pub fn response_create(instructions: &str) -> Self {
        ClientEvent::ResponseCreate {
            response: ResponseConfig {
                modalities: vec![Modality::Text, Modality::Audio],
                instructions: Some(instructions.to_string()),
            },
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::InputAudioBufferCommit => "input_audio_buffer.commit",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate { .. } => "response.create",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Server Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ErrorPayload },

    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        audio_end_ms: Option<u64>,
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted { item_id: Option<String> },

    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated,

    #[serde(rename = "response.created")]
    ResponseCreated,

    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },

    #[serde(rename = "response.text.done")]
    TextDone,

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { transcript: String },

    /// Base64 PCM16 chunk of assistant speech.
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.done")]
    ResponseDone { response: Option<ResponseSummary> },

    /// Any event type this client does not know.
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::SessionCreated => "session.created",
            Self::SessionUpdated => "session.updated",
            Self::SpeechStarted => "input_audio_buffer.speech_started",
            Self::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            Self::InputAudioBufferCommitted { .. } => "input_audio_buffer.committed",
            Self::ConversationItemCreated => "conversation.item.created",
            Self::ResponseCreated => "response.created",
            Self::TextDelta { .. } => "response.text.delta",
            Self::TextDone => "response.text.done",
            Self::AudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::AudioTranscriptDone { .. } => "response.audio_transcript.done",
            Self::AudioDelta { .. } => "response.audio.delta",
            Self::AudioDone => "response.audio.done",
            Self::ResponseDone { .. } => "response.done",
            Self::Unknown => "unknown",
        }
    }
}

/// Error payload of an `error` event.
///
/// The hosted API sends an object; the relay reports its own failures as a
/// bare message string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Message(String),
    Detail(ApiError),
}

impl ErrorPayload {
    pub fn message(&self) -> &str {
        match self {
            Self::Message(message) => message,
            Self::Detail(detail) => &detail.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseSummary {
    pub id: Option<String>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
struct EventTag {
    #[serde(rename = "type")]
    event_type: String,
}

/// Parse a server event, logging event types that are not recognized.
///
/// Text without a `type` discriminator is a parse error.
pub fn parse_server_event(text: &str) -> Result<ServerEvent, serde_json::Error> {
    let event: ServerEvent = serde_json::from_str(text)?;
    if event == ServerEvent::Unknown
        && let Ok(tag) = serde_json::from_str::<EventTag>(text)
    {
        warn!(event_type = %tag.event_type, "Ignoring unknown protocol event");
    }
    Ok(event)
}

/// JSON for an `error` event reported to the client by the relay.
pub fn relay_error_event(message: &str) -> String {
    serde_json::json!({ "type": "error", "error": message }).to_string()
}
