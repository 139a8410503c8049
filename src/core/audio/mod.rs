//! Client-side audio pipeline: PCM codec, WAV container, capture and playback.

pub mod capture;
pub mod pcm;
pub mod playback;
pub mod wav;

pub use capture::{
    AudioFrame, CAPTURE_SAMPLE_RATE, CaptureError, CaptureSession, ChannelMicrophone, FRAME_SIZE,
    FrameCallback, FramePipeline, Microphone,
};
pub use pcm::{bytes_to_transport_text, decode_pcm16, encode_pcm16, transport_text_to_bytes};
pub use playback::{AudioOutput, PlaybackError, PlaybackQueue};
pub use wav::AudioClip;
