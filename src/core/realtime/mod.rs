//! Realtime protocol: configuration, event types and the upstream connection.

pub mod config;
pub mod events;
pub mod upstream;

pub use config::{
    DEFAULT_REALTIME_MODEL, DEFAULT_RESPONSE_INSTRUCTIONS, Modality, OPENAI_REALTIME_URL,
    REALTIME_SAMPLE_RATE, RealtimeVoice, SessionMode,
};
pub use events::{
    ClientEvent, ErrorPayload, ServerEvent, SessionConfig, TurnDetection, parse_server_event,
    relay_error_event,
};
pub use upstream::{
    RealtimeError, RealtimeResult, UpstreamConfig, UpstreamSocket, connect_upstream,
};
