//! PCM16 codec and transport text encoding.
//!
//! Float samples in [-1.0, 1.0] are converted to signed 16-bit little-endian
//! PCM for the wire, and PCM bytes travel inside JSON events as standard
//! base64 text.

use base64::prelude::*;

/// Scale applied to negative samples (maps -1.0 to `i16::MIN`).
pub const PCM16_NEGATIVE_SCALE: f32 = 32768.0;

/// Scale applied to non-negative samples (maps 1.0 to `i16::MAX`).
pub const PCM16_POSITIVE_SCALE: f32 = 32767.0;

/// Bytes per PCM16 sample.
pub const PCM16_BYTES_PER_SAMPLE: usize = 2;

/// Encode float samples as PCM16 little-endian bytes.
///
/// Every sample is clamped to [-1.0, 1.0] before scaling and NaN is treated
/// as silence, so any input slice produces exactly `2 * samples.len()` bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * PCM16_BYTES_PER_SAMPLE);
    for &sample in samples {
        out.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    out
}

/// Decode PCM16 little-endian bytes back to float samples.
///
/// A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(PCM16_BYTES_PER_SAMPLE)
        .map(|pair| i16_to_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

#[inline]
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    let scaled = if clamped < 0.0 {
        clamped * PCM16_NEGATIVE_SCALE
    } else {
        clamped * PCM16_POSITIVE_SCALE
    };
    scaled.round() as i16
}

#[inline]
pub fn i16_to_sample(value: i16) -> f32 {
    if value < 0 {
        value as f32 / PCM16_NEGATIVE_SCALE
    } else {
        value as f32 / PCM16_POSITIVE_SCALE
    }
}

/// Encode raw bytes as transport text (standard base64).
pub fn bytes_to_transport_text(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

/// Decode transport text back into raw bytes.
pub fn transport_text_to_bytes(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64_STANDARD.decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_extremes() {
        let bytes = encode_pcm16(&[-1.0, 0.0, 1.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MIN);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 0);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), i16::MAX);
    }

    #[test]
    fn test_encode_clamps_out_of_range_and_nan() {
        let bytes = encode_pcm16(&[4.5, -7.0, f32::NAN, f32::INFINITY, f32::NEG_INFINITY]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(values, vec![i16::MAX, i16::MIN, 0, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_encode_is_little_endian() {
        // 0.5 * 32767 = 16383.5, rounds to 16384 = 0x4000
        let bytes = encode_pcm16(&[0.5]);
        assert_eq!(bytes, vec![0x00, 0x40]);
    }

    #[test]
    fn test_encode_empty() {
        assert!(encode_pcm16(&[]).is_empty());
        assert!(decode_pcm16(&[]).is_empty());
    }

    #[test]
    fn test_decode_ignores_trailing_odd_byte() {
        let mut bytes = encode_pcm16(&[0.25, -0.25]);
        bytes.push(0x7f);
        assert_eq!(decode_pcm16(&bytes).len(), 2);
    }

    #[test]
    fn test_pcm_round_trip_within_one_step() {
        let tolerance = 1.0 / 32768.0;
        let mut x = -1.0f32;
        while x <= 1.0 {
            let decoded = decode_pcm16(&encode_pcm16(&[x]));
            assert!(
                (decoded[0] - x).abs() <= tolerance,
                "sample {x} decoded to {}",
                decoded[0]
            );
            x += 0.0007;
        }
    }

    #[test]
    fn test_transport_text_round_trip() {
        let payloads: [&[u8]; 4] = [b"", b"\x00", b"\xff\xfe\x00\x01", &[7u8; 4096]];
        for payload in payloads {
            let text = bytes_to_transport_text(payload);
            assert_eq!(transport_text_to_bytes(&text).unwrap(), payload);
        }
    }

    #[test]
    fn test_transport_text_is_standard_base64() {
        assert_eq!(bytes_to_transport_text(b"\xfb\xff"), "+/8=");
        assert!(transport_text_to_bytes("not base64!").is_err());
    }
}
