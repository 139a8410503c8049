//! Strictly ordered playback of assistant audio.
//!
//! Payloads are base64 PCM16 chunks exactly as they arrive in
//! `response.audio.delta` events. The queue decodes and plays them one at a
//! time in arrival order; a chunk that fails to decode or play is logged and
//! skipped so later chunks still play.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::pcm::{PCM16_BYTES_PER_SAMPLE, transport_text_to_bytes};
use super::wav::{AudioClip, decode_clip, wrap_pcm16};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Invalid transport payload: {0}")]
    InvalidPayload(#[from] base64::DecodeError),

    #[error("Odd PCM16 byte count: {0}")]
    TruncatedSample(usize),

    #[error("Failed to decode audio: {0}")]
    Decode(#[from] hound::Error),

    #[error("Audio output failed: {0}")]
    Output(String),
}

/// Sink that renders decoded clips.
///
/// `play` resolves once the clip has finished playing; the queue does not
/// start the next clip until then.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play(&self, clip: AudioClip) -> Result<(), PlaybackError>;
}

struct QueueInner {
    pending: Mutex<VecDeque<String>>,
    busy: AtomicBool,
    played: AtomicU64,
    failed: AtomicU64,
    sample_rate: u32,
    output: Arc<dyn AudioOutput>,
    idle: Notify,
}

/// FIFO playback queue with at most one clip in flight.
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<QueueInner>,
}

impl PlaybackQueue {
    pub fn new(output: Arc<dyn AudioOutput>, sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(VecDeque::new()),
                busy: AtomicBool::new(false),
                played: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                sample_rate,
                output,
                idle: Notify::new(),
            }),
        }
    }

    /// Append a payload and start draining if the queue is idle.
    ///
    /// Never fails; decode and playback errors are handled inside the drain.
    pub fn enqueue(&self, payload: impl Into<String>) {
        self.inner.pending.lock().push_back(payload.into());
        QueueInner::try_start(&self.inner);
    }

    /// Number of payloads waiting to be played.
    pub fn len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when nothing is queued and nothing is playing.
    pub fn is_idle(&self) -> bool {
        !self.inner.busy.load(Ordering::Acquire) && self.is_empty()
    }

    /// Count of clips played successfully.
    pub fn played_count(&self) -> u64 {
        self.inner.played.load(Ordering::Relaxed)
    }

    /// Count of payloads discarded after a decode or playback failure.
    pub fn failed_count(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Wait until every queued payload has been played or discarded.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl QueueInner {
    fn try_start(inner: &Arc<Self>) {
        if inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = inner.clone();
            tokio::spawn(async move { inner.drain().await });
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some(payload) => match self.play_one(&payload).await {
                    Ok(()) => {
                        self.played.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Discarding audio chunk that failed to play");
                    }
                },
                None => {
                    self.busy.store(false, Ordering::Release);
                    // An enqueue may have landed between the pop and the store.
                    let refill = !self.pending.lock().is_empty();
                    if refill
                        && self
                            .busy
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        continue;
                    }
                    self.idle.notify_waiters();
                    return;
                }
            }
        }
    }

    async fn play_one(&self, payload: &str) -> Result<(), PlaybackError> {
        let pcm = transport_text_to_bytes(payload)?;
        if pcm.len() % PCM16_BYTES_PER_SAMPLE != 0 {
            return Err(PlaybackError::TruncatedSample(pcm.len()));
        }
        let clip = decode_clip(&wrap_pcm16(&pcm, self.sample_rate))?;
        debug!(samples = clip.samples.len(), "Playing audio chunk");
        self.output.play(clip).await
    }
}
