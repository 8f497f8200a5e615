use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};

use crate::error::{ChimeError, Result};

/// Sample rate of audio sent to the service.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Sample rate of audio the service sends back, unless the MIME type says otherwise.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Base64 payload with its MIME type, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// Decoded mono or interleaved audio ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    /// Length of the buffer in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        let frames = self.samples.len() / self.channels as usize;
        frames as f64 / f64::from(self.sample_rate)
    }
}

/// Encode float samples into a PCM16 blob at `sample_rate`.
#[must_use]
pub fn encode_pcm(samples: &[f32], sample_rate: u32) -> Blob {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let v = (clamped * f32::from(i16::MAX)) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }

    Blob {
        data: B64.encode(&bytes),
        mime_type: format!("audio/pcm;rate={sample_rate}"),
    }
}

/// Decode a PCM16 blob. The rate comes from the MIME type's `rate=`
/// parameter when present, else `default_rate`.
pub fn decode_pcm(blob: &Blob, default_rate: u32, channels: u16) -> Result<AudioBuffer> {
    if !blob.mime_type.starts_with("audio/pcm") {
        return Err(ChimeError::Decode(format!(
            "unsupported audio mime type: {}",
            blob.mime_type
        )));
    }

    let bytes = B64
        .decode(blob.data.as_bytes())
        .map_err(|e| ChimeError::Decode(format!("invalid base64 audio: {e}")))?;

    if bytes.len() % 2 != 0 {
        return Err(ChimeError::Decode(format!(
            "odd PCM16 payload length: {} bytes",
            bytes.len()
        )));
    }

    let sample_rate = mime_rate(&blob.mime_type).unwrap_or(default_rate);
    if sample_rate == 0 {
        return Err(ChimeError::Decode("sample rate of zero".to_string()));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();

    Ok(AudioBuffer {
        samples,
        sample_rate,
        channels,
    })
}

fn mime_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Root-mean-square level of a block of samples, in 0.0..=1.0.
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt().min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_clamps_and_tags_rate() {
        let blob = encode_pcm(&[1.5, -1.5, 0.0], CAPTURE_SAMPLE_RATE);
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");

        let bytes = B64.decode(&blob.data).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(bytes.len(), 6);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), 0);
    }

    #[test]
    fn decode_uses_mime_rate() {
        let pcm: Vec<u8> = [0i16, 16384, -32768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let blob = Blob {
            data: B64.encode(&pcm),
            mime_type: "audio/pcm;rate=24000".to_string(),
        };

        let buffer = decode_pcm(&blob, 8000, 1).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(buffer.sample_rate, 24000);
        assert_eq!(buffer.samples, vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn decode_falls_back_to_default_rate() {
        let blob = Blob {
            data: B64.encode([0u8; 48_000]),
            mime_type: "audio/pcm".to_string(),
        };
        let buffer = decode_pcm(&blob, PLAYBACK_SAMPLE_RATE, 1).unwrap_or_else(|e| panic!("{e}"));
        assert!((buffer.duration_secs() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn decode_rejects_garbage() {
        let bad_b64 = Blob {
            data: "!!not base64!!".to_string(),
            mime_type: "audio/pcm;rate=24000".to_string(),
        };
        assert!(matches!(
            decode_pcm(&bad_b64, PLAYBACK_SAMPLE_RATE, 1),
            Err(ChimeError::Decode(_))
        ));

        let odd = Blob {
            data: B64.encode([1u8, 2, 3]),
            mime_type: "audio/pcm;rate=24000".to_string(),
        };
        assert!(decode_pcm(&odd, PLAYBACK_SAMPLE_RATE, 1).is_err());

        let wrong_type = Blob {
            data: B64.encode([0u8, 0]),
            mime_type: "audio/mpeg".to_string(),
        };
        assert!(decode_pcm(&wrong_type, PLAYBACK_SAMPLE_RATE, 1).is_err());
    }

    #[test]
    fn rms_of_silence_and_full_scale() {
        assert!(rms(&[]).abs() < f32::EPSILON);
        assert!(rms(&[0.0; 64]).abs() < f32::EPSILON);
        assert!((rms(&[1.0, -1.0, 1.0, -1.0]) - 1.0).abs() < 1e-6);
    }
}
