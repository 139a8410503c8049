//! Realtime API configuration types.
//!
//! Endpoint constants, voice selection, response modalities and the
//! conversation mode a session runs in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Realtime API WebSocket endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Header that opts the connection into the realtime protocol.
pub const REALTIME_BETA_HEADER: &str = "OpenAI-Beta";
pub const REALTIME_BETA_VALUE: &str = "realtime=v1";

/// Audio sample rate used on both legs of a session.
pub const REALTIME_SAMPLE_RATE: u32 = 24000;

/// Model requested when none is configured.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

/// Wire name of the PCM16 audio format.
pub const PCM16_AUDIO_FORMAT: &str = "pcm16";

/// Instruction sent with every `response.create` unless overridden.
pub const DEFAULT_RESPONSE_INSTRUCTIONS: &str = "Please assist the user.";

// =============================================================================
// Voices
// =============================================================================

/// Voices accepted by the realtime API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeVoice {
    #[default]
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl RealtimeVoice {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }

    /// Parse a voice name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|voice| voice.as_str().eq_ignore_ascii_case(s.trim()))
    }

    pub fn all() -> &'static [RealtimeVoice] {
        &[
            Self::Alloy,
            Self::Ash,
            Self::Ballad,
            Self::Coral,
            Self::Echo,
            Self::Sage,
            Self::Shimmer,
            Self::Verse,
        ]
    }
}

impl fmt::Display for RealtimeVoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Modalities
// =============================================================================

/// Output modalities requested in `response.create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

// =============================================================================
// Session mode
// =============================================================================

/// How user turns are delimited.
///
/// In `Auto` mode the server's voice activity detection decides when the user
/// stopped speaking. In `Manual` mode the user holds a key while talking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Auto,
    #[default]
    Manual,
}

impl SessionMode {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "vad" => Ok(Self::Auto),
            "manual" | "push-to-talk" | "ptt" => Ok(Self::Manual),
            other => Err(format!("Unknown session mode '{other}', expected auto or manual")),
        }
    }
}
