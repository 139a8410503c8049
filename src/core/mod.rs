pub mod audio;
pub mod realtime;

// Re-export commonly used types for convenience
pub use audio::{
    AudioClip, AudioFrame, AudioOutput, CaptureError, CaptureSession, Microphone, PlaybackError,
    PlaybackQueue,
};
pub use realtime::{ClientEvent, RealtimeError, RealtimeResult, ServerEvent, SessionMode};
