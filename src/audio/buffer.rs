use super::codec::CAPTURE_SAMPLE_RATE;

/// A fixed-size block of 16kHz mono audio bound for the session.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub samples: Vec<f32>,
    /// Capture epoch the frame was produced in. Frames from an earlier epoch
    /// are stale and must not be forwarded.
    pub epoch: u64,
}

impl OutboundFrame {
    #[must_use]
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / CAPTURE_SAMPLE_RATE as f32
    }
}

/// Cuts a continuous 16kHz mono stream into frames of exactly `frame_samples`.
pub struct FrameAssembler {
    buffer: Vec<f32>,
    frame_samples: usize,
    epoch: u64,
}

impl FrameAssembler {
    #[must_use]
    pub fn new(frame_samples: usize, epoch: u64) -> Self {
        Self {
            buffer: Vec::with_capacity(frame_samples),
            frame_samples: frame_samples.max(1),
            epoch,
        }
    }

    /// Feed samples and return any complete frames, oldest first.
    pub fn feed(&mut self, samples: &[f32]) -> Vec<OutboundFrame> {
        self.buffer.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_samples {
            let frame: Vec<f32> = self.buffer.drain(..self.frame_samples).collect();
            frames.push(OutboundFrame {
                samples: frame,
                epoch: self.epoch,
            });
        }

        frames
    }

    /// Samples waiting for the next frame. These are thrown away on stop.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
