//! WAV container for playback.
//!
//! Assistant audio arrives as headerless PCM16; each chunk is wrapped in a
//! canonical 44-byte RIFF header before it is handed to the decoder.

use std::io::Cursor;

/// Size of the canonical PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

/// Create a WAV file header for PCM audio.
///
/// The byte rate and block alignment are derived from the other fields, so
/// a 24 kHz mono 16-bit header declares 48000 bytes per second.
pub fn create_header(
    data_size: u32,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
) -> [u8; WAV_HEADER_LEN] {
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
    let block_align = channels * bits_per_sample / 8;
    let riff_size = 36 + data_size;

    let mut header = [0u8; WAV_HEADER_LEN];

    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&riff_size.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");

    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // linear PCM
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());

    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_size.to_le_bytes());

    header
}

/// Wrap mono PCM16 bytes in a WAV container.
pub fn wrap_pcm16(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let header = create_header(pcm.len() as u32, sample_rate, 1, 16);
    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    wav.extend_from_slice(&header);
    wav.extend_from_slice(pcm);
    wav
}

/// Decoded audio ready for an output device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioClip {
    /// Playback length of the clip.
    pub fn duration(&self) -> std::time::Duration {
        let frames = self.samples.len() as u64 / u64::from(self.channels.max(1));
        std::time::Duration::from_micros(frames * 1_000_000 / u64::from(self.sample_rate.max(1)))
    }
}

/// Decode a 16-bit WAV container into samples.
pub fn decode_clip(wav: &[u8]) -> Result<AudioClip, hound::Error> {
    let reader = hound::WavReader::new(Cursor::new(wav))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(hound::Error::Unsupported);
    }
    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AudioClip {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}
