use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::audioadapter::Adapter;
use rubato::{Fft, FixedSync, Resampler as RubatoResampler};

use crate::error::{ChimeError, Result};

/// Downmixes interleaved device audio to mono and converts it to `target_rate`.
pub struct Resampler {
    inner: Option<Fft<f32>>,
    channels: u16,
    input_buf: Vec<f32>,
}

impl Resampler {
    pub fn new(source_rate: u32, channels: u16, target_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(ChimeError::Resample("device reports zero channels".to_string()));
        }

        let inner = if source_rate == target_rate {
            None
        } else {
            Some(
                Fft::new(
                    source_rate as usize,
                    target_rate as usize,
                    1024,
                    2, // sub_chunks
                    1,
                    FixedSync::Input,
                )
                .map_err(|e| ChimeError::Resample(format!("failed to create resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            channels,
            input_buf: Vec::new(),
        })
    }

    /// Process interleaved multi-channel samples into mono at the target rate.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let mono = downmix(interleaved, self.channels);

        let Some(ref mut resampler) = self.inner else {
            return Ok(mono);
        };

        self.input_buf.extend_from_slice(&mono);

        let mut output = Vec::new();
        let frames_needed = resampler.input_frames_next();

        while self.input_buf.len() >= frames_needed {
            let chunk: Vec<f32> = self.input_buf.drain(..frames_needed).collect();
            let input_data = vec![chunk];
            let input_buf = SequentialSliceOfVecs::new(&input_data, 1, frames_needed)
                .map_err(|e| ChimeError::Resample(format!("buffer error: {e}")))?;
            let result = resampler
                .process(&input_buf, 0, None)
                .map_err(|e| ChimeError::Resample(format!("resample error: {e}")))?;
            for frame in 0..result.frames() {
                output.push(result.read_sample(0, frame).unwrap_or(0.0));
            }
        }

        Ok(output)
    }
}

fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    let ch = channels as usize;
    interleaved
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_16k_mono() {
        let mut r = Resampler::new(16000, 1, 16000).unwrap_or_else(|e| panic!("{e}"));
        let input: Vec<f32> = (0..1600).map(|i| (i as f32 / 1600.0).sin()).collect();
        let output = r.process(&input).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(output, input);
    }

    #[test]
    fn stereo_to_mono() {
        let mut r = Resampler::new(16000, 2, 16000).unwrap_or_else(|e| panic!("{e}"));
        let input = [0.2f32, 0.4, -1.0, 1.0];
        let output = r.process(&input).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(output.len(), 2);
        assert!((output[0] - 0.3).abs() < 1e-6);
        assert!(output[1].abs() < 1e-6);
    }

    #[test]
    fn downsamples_48k_to_16k() {
        let mut r = Resampler::new(48000, 1, 16000).unwrap_or_else(|e| panic!("{e}"));
        let mut total = 0;
        for _ in 0..10 {
            total += r
                .process(&[0.0f32; 4800])
                .unwrap_or_else(|e| panic!("{e}"))
                .len();
        }
        // 1s in, roughly 1/3 out (the FFT resampler holds back partial chunks).
        assert!(total > 12000 && total <= 16000, "got {total}");
    }

    #[test]
    fn zero_channels_rejected() {
        assert!(Resampler::new(16000, 0, 16000).is_err());
    }
}
