//! File-backed audio devices for headless sessions.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::audio::pcm::i16_to_sample;
use crate::core::audio::{AudioClip, AudioOutput, CaptureError, Microphone, PlaybackError};

/// Samples delivered per block by [`WavFileMicrophone`] (~43 ms at 24 kHz)
const BLOCK_SAMPLES: usize = 1024;

/// Microphone that plays back a mono 16-bit WAV file.
///
/// Blocks are paced at the file's real-time rate unless pacing is disabled.
/// Trailing silence can be appended so voice activity detection sees the end
/// of speech.
pub struct WavFileMicrophone {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    pace: bool,
    trailing_silence: Duration,
}

impl WavFileMicrophone {
    pub fn from_wav(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} must be mono 16-bit PCM, got {} channel(s) at {} bits",
                path.display(),
                spec.channels,
                spec.bits_per_sample
            )));
        }
        if spec.sample_rate == 0 {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} declares a sample rate of 0 Hz",
                path.display()
            )));
        }

        let samples = reader
            .samples::<i16>()
            .map(|sample| sample.map(i16_to_sample))
            .collect::<Result<Vec<f32>, _>>()
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {e}", path.display())))?;

        info!(
            path = %path.display(),
            samples = samples.len(),
            sample_rate = spec.sample_rate,
            "Loaded WAV microphone input"
        );

        Ok(Self::from_samples(samples, spec.sample_rate))
    }

    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: Arc::new(samples),
            sample_rate,
            pace: true,
            trailing_silence: Duration::ZERO,
        }
    }

    /// Deliver blocks as fast as they are consumed.
    pub fn unpaced(mut self) -> Self {
        self.pace = false;
        self
    }

    pub fn with_trailing_silence(mut self, silence: Duration) -> Self {
        self.trailing_silence = silence;
        self
    }

    /// Length of the recording plus trailing silence.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return self.trailing_silence;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
            + self.trailing_silence
    }
}

impl Microphone for WavFileMicrophone {
    fn open(&self, sample_rate: u32) -> Result<BoxStream<'static, Vec<f32>>, CaptureError> {
        if sample_rate != self.sample_rate {
            return Err(CaptureError::UnsupportedFormat(format!(
                "input is {} Hz, capture needs {} Hz",
                self.sample_rate, sample_rate
            )));
        }

        let silence_samples =
            (self.trailing_silence.as_secs_f64() * sample_rate as f64).round() as usize;
        let total = self.samples.len() + silence_samples;
        let block_period = Duration::from_secs_f64(BLOCK_SAMPLES as f64 / sample_rate as f64);
        let samples = self.samples.clone();
        let pace = self.pace;

        let blocks = stream::unfold(0usize, move |offset| {
            let samples = samples.clone();
            async move {
                if offset >= total {
                    debug!("WAV microphone input exhausted");
                    return None;
                }
                if pace {
                    tokio::time::sleep(block_period).await;
                }
                let end = (offset + BLOCK_SAMPLES).min(total);
                let block: Vec<f32> = (offset..end)
                    .map(|i| samples.get(i).copied().unwrap_or(0.0))
                    .collect();
                Some((block, end))
            }
        });

        Ok(blocks.boxed())
    }
}

/// Audio output that appends every played clip to a WAV file.
pub struct WavFileOutput {
    path: PathBuf,
    writer: Mutex<Option<hound::WavWriter<BufWriter<File>>>>,
}

impl WavFileOutput {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, PlaybackError> {
        let path = path.as_ref().to_path_buf();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Write the final header. Later clips are rejected.
    pub fn finalize(&self) -> Result<(), PlaybackError> {
        if let Some(writer) = self.writer.lock().take() {
            writer.finalize()?;
            info!(path = %self.path.display(), "Assistant audio written");
        }
        Ok(())
    }
}

#[async_trait]
impl AudioOutput for WavFileOutput {
    async fn play(&self, clip: AudioClip) -> Result<(), PlaybackError> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| PlaybackError::Output(format!("{} is finalized", self.path.display())))?;
        for sample in &clip.samples {
            writer.write_sample(*sample)?;
        }
        Ok(())
    }
}

/// Output that discards audio.
pub struct NullOutput;

#[async_trait]
impl AudioOutput for NullOutput {
    async fn play(&self, _clip: AudioClip) -> Result<(), PlaybackError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for sample in samples {
            writer.write_sample(*sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test]
    async fn test_wav_microphone_blocks_and_silence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.wav");
        write_wav(&path, 24000, 1, &vec![16384i16; 1500]);

        let microphone = WavFileMicrophone::from_wav(&path)
            .unwrap()
            .unpaced()
            .with_trailing_silence(Duration::from_millis(100));

        let blocks: Vec<Vec<f32>> = microphone.open(24000).unwrap().collect().await;
        let total: usize = blocks.iter().map(Vec::len).sum();
        assert_eq!(total, 1500 + 2400);
        assert_eq!(blocks[0].len(), BLOCK_SAMPLES);
        assert!((blocks[0][0] - 0.5).abs() < 1e-3);
        assert_eq!(*blocks.last().unwrap().last().unwrap(), 0.0);
    }

    #[test]
    fn test_wav_microphone_rejects_stereo() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 24000, 2, &[0, 0, 0, 0]);

        assert!(matches!(
            WavFileMicrophone::from_wav(&path),
            Err(CaptureError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_wav_microphone_rate_mismatch() {
        let microphone = WavFileMicrophone::from_samples(vec![0.0; 10], 16000);
        assert!(matches!(
            microphone.open(24000),
            Err(CaptureError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_wav_microphone_rejects_zero_rate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zero.wav");
        let pcm: Vec<u8> = [100i16, -100].iter().flat_map(|s| s.to_le_bytes()).collect();
        std::fs::write(&path, crate::core::audio::wav::wrap_pcm16(&pcm, 0)).unwrap();

        assert!(WavFileMicrophone::from_wav(&path).is_err());

        // Samples without a usable rate report only the padding
        let microphone = WavFileMicrophone::from_samples(vec![0.0; 10], 0)
            .with_trailing_silence(Duration::from_millis(250));
        assert_eq!(microphone.duration(), Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        assert!(matches!(
            WavFileMicrophone::from_wav("/nonexistent/input.wav"),
            Err(CaptureError::DeviceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_wav_output_appends_clips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.wav");
        let output = WavFileOutput::create(&path, 24000).unwrap();

        for chunk in [vec![1i16, 2, 3], vec![4i16, 5]] {
            output
                .play(AudioClip {
                    samples: chunk,
                    sample_rate: 24000,
                    channels: 1,
                })
                .await
                .unwrap();
        }
        output.finalize().unwrap();

        let samples: Vec<i16> = hound::WavReader::open(&path)
            .unwrap()
            .into_samples::<i16>()
            .map(Result::unwrap)
            .collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5]);

        let late = output
            .play(AudioClip {
                samples: vec![6],
                sample_rate: 24000,
                channels: 1,
            })
            .await;
        assert!(matches!(late, Err(PlaybackError::Output(_))));
    }
}
