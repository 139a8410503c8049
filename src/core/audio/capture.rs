//! Microphone capture with fixed-size framing.
//!
//! A [`CaptureSession`] owns at most one open microphone stream. Samples are
//! cut into frames of [`FRAME_SIZE`] samples, encoded as PCM16 and handed to
//! the frame callback in arrival order. Stopping the session releases the
//! device and guarantees the callback is not invoked again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pcm::{bytes_to_transport_text, encode_pcm16};

/// Capture sample rate expected by the realtime API.
pub const CAPTURE_SAMPLE_RATE: u32 = 24000;

/// Samples per emitted frame.
pub const FRAME_SIZE: usize = 2048;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Microphone is already in use")]
    DeviceBusy,

    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("Capture session already started")]
    AlreadyStarted,
}

/// One frame of captured audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Arrival order within the capture session, starting at 0.
    pub sequence: u64,
    /// PCM16 little-endian bytes.
    pub pcm: Bytes,
}

impl AudioFrame {
    /// Base64 text of the frame's PCM bytes.
    pub fn to_transport_text(&self) -> String {
        bytes_to_transport_text(&self.pcm)
    }
}

pub type FrameCallback = Arc<dyn Fn(AudioFrame) + Send + Sync>;

/// An audio input device.
///
/// `open` acquires the device and returns a stream of float sample blocks.
/// Dropping the stream releases the device.
pub trait Microphone: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<BoxStream<'static, Vec<f32>>, CaptureError>;
}

/// Cuts arbitrary sample blocks into fixed-size PCM16 frames.
#[derive(Debug)]
pub struct FramePipeline {
    frame_size: usize,
    buffer: Vec<f32>,
    next_sequence: u64,
}

impl FramePipeline {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            buffer: Vec::with_capacity(frame_size),
            next_sequence: 0,
        }
    }

    /// Feed samples, returning every frame completed by them.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_size - self.buffer.len()).min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == self.frame_size {
                frames.push(self.emit());
            }
        }
        frames
    }

    /// Pad any partial frame with silence and emit it.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        self.buffer.resize(self.frame_size, 0.0);
        Some(self.emit())
    }

    fn emit(&mut self) -> AudioFrame {
        let frame = AudioFrame {
            sequence: self.next_sequence,
            pcm: Bytes::from(encode_pcm16(&self.buffer)),
        };
        self.next_sequence += 1;
        self.buffer.clear();
        frame
    }
}

struct ActiveCapture {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Scoped microphone capture.
pub struct CaptureSession {
    microphone: Arc<dyn Microphone>,
    frame_size: usize,
    active: Option<ActiveCapture>,
}

impl CaptureSession {
    pub fn new(microphone: Arc<dyn Microphone>) -> Self {
        Self::with_frame_size(microphone, FRAME_SIZE)
    }

    pub fn with_frame_size(microphone: Arc<dyn Microphone>, frame_size: usize) -> Self {
        Self {
            microphone,
            frame_size,
            active: None,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.active.is_some()
    }

    /// Open the microphone and start delivering frames to `on_frame`.
    pub fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }

        let mut stream = self.microphone.open(CAPTURE_SAMPLE_RATE)?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut pipeline = FramePipeline::new(self.frame_size);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    block = stream.next() => match block {
                        Some(samples) => {
                            for frame in pipeline.push(&samples) {
                                if token.is_cancelled() {
                                    return;
                                }
                                on_frame(frame);
                            }
                        }
                        None => {
                            debug!("Microphone stream ended");
                            if let Some(frame) = pipeline.flush() {
                                on_frame(frame);
                            }
                            break;
                        }
                    },
                }
            }
        });

        info!(frame_size = self.frame_size, "Audio capture started");
        self.active = Some(ActiveCapture { cancel, task });
        Ok(())
    }

    /// Release the microphone. No frame callback runs after this returns.
    pub async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if let Err(e) = active.task.await {
                warn!(error = %e, "Capture task ended abnormally");
            }
            info!("Audio capture stopped");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            active.task.abort();
        }
    }
}

/// Microphone fed programmatically through a broadcast channel.
///
/// Blocks pushed while the device is closed are dropped, like a physical
/// microphone nobody is listening to. Only one stream may be open at a time.
#[derive(Clone)]
pub struct ChannelMicrophone {
    sender: broadcast::Sender<Vec<f32>>,
    in_use: Arc<AtomicBool>,
}

impl ChannelMicrophone {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Push a block of samples. Returns false when no stream is open.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        self.sender.send(samples).is_ok()
    }

    pub fn is_open(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

impl Default for ChannelMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

struct InUseGuard(Arc<AtomicBool>);

impl Drop for InUseGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Microphone for ChannelMicrophone {
    fn open(&self, _sample_rate: u32) -> Result<BoxStream<'static, Vec<f32>>, CaptureError> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::DeviceBusy);
        }

        let guard = InUseGuard(self.in_use.clone());
        let receiver = self.sender.subscribe();
        let stream = futures::stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
            loop {
                match receiver.recv().await {
                    Ok(samples) => return Some((samples, (receiver, guard))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Microphone consumer lagged, dropping sample blocks");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
