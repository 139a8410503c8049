//! Voice client: conversation state machine, relay session and file-backed
//! audio devices.

pub mod controller;
pub mod io;
pub mod session;

pub use controller::{AckKind, Action, ConversationController, ConversationState};
pub use io::{NullOutput, WavFileMicrophone, WavFileOutput};
pub use session::{
    ClientError, DEFAULT_ACK_TIMEOUT, SessionEvent, SessionReport, UserSignal, VoiceSession,
    VoiceSessionConfig, VoiceSessionHandle,
};
