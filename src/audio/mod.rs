pub mod buffer;
pub mod capture;
pub mod codec;
pub mod playback;
pub mod resample;
pub mod scheduler;

use crossbeam_channel::bounded;
use tokio::sync::mpsc;

use crate::error::{ChimeError, Result};

use self::buffer::{FrameAssembler, OutboundFrame};
use self::capture::{ActiveInput, Microphone};
use self::codec::CAPTURE_SAMPLE_RATE;
use self::resample::Resampler;

/// Owns the microphone while recording and turns its output into
/// fixed-size 16kHz frames on `frame_tx`.
pub struct CapturePipeline {
    microphone: Box<dyn Microphone>,
    frame_samples: usize,
    frame_tx: mpsc::Sender<OutboundFrame>,
    input: Option<Box<dyn ActiveInput>>,
    epoch: u64,
}

impl CapturePipeline {
    #[must_use]
    pub fn new(
        microphone: Box<dyn Microphone>,
        frame_samples: usize,
        frame_tx: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            microphone,
            frame_samples,
            frame_tx,
            input: None,
            epoch: 0,
        }
    }

    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.input.is_some()
    }

    /// Epoch stamped on frames from the current capture. Anything else is stale.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a frame should still be forwarded to the session.
    #[must_use]
    pub fn accepts(&self, frame: &OutboundFrame) -> bool {
        self.is_capturing() && frame.epoch == self.epoch
    }

    /// Start capturing. Returns `Ok(false)` if already capturing.
    ///
    /// On error nothing is kept: no stream, no worker, and the epoch is unchanged.
    pub fn start(&mut self) -> Result<bool> {
        if self.input.is_some() {
            return Ok(false);
        }

        let epoch = self.epoch + 1;

        // Bounded channel, try_send in the audio callback so it never blocks
        let (raw_tx, raw_rx) = bounded::<Vec<f32>>(64);
        let input = self.microphone.open(Box::new(move |data: &[f32]| {
            let _ = raw_tx.try_send(data.to_vec());
        }))?;

        let sample_rate = input.sample_rate();
        let channels = input.channels();
        // A device we cannot convert from is a device problem for the user.
        let mut resampler = Resampler::new(sample_rate, channels, CAPTURE_SAMPLE_RATE)
            .map_err(|e| ChimeError::Device(format!("unsupported input format: {e}")))?;
        let mut assembler = FrameAssembler::new(self.frame_samples, epoch);
        let frame_tx = self.frame_tx.clone();

        std::thread::spawn(move || {
            tracing::debug!(
                "capture pipeline: epoch={epoch}, source_rate={sample_rate}, channels={channels}"
            );

            while let Ok(raw_samples) = raw_rx.recv() {
                let mono_16k = match resampler.process(&raw_samples) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("resample error: {e}");
                        continue;
                    }
                };

                for frame in assembler.feed(&mono_16k) {
                    if frame_tx.blocking_send(frame).is_err() {
                        tracing::debug!("frame receiver dropped, stopping capture pipeline");
                        return;
                    }
                }
            }

            // The partial frame left in the assembler is dropped with it.
            tracing::debug!(
                "capture pipeline epoch={epoch} exiting, discarding {} samples",
                assembler.pending()
            );
        });

        self.input = Some(input);
        self.epoch = epoch;
        tracing::info!("capture started (epoch {epoch})");
        Ok(true)
    }

    /// Stop capturing and release the device. Returns `false` if not capturing.
    pub fn stop(&mut self) -> bool {
        let Some(input) = self.input.take() else {
            return false;
        };
        drop(input);
        // Frames still in flight carry the old epoch and get dropped on arrival.
        self.epoch += 1;
        tracing::info!("capture stopped");
        true
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::capture::{ActiveInput, Microphone, SampleCallback};
    use crate::error::{ChimeError, Result};

    /// Shared handle to the callback of the most recently opened fake input.
    #[derive(Clone, Default)]
    pub struct FakeTap {
        callback: Arc<Mutex<Option<SampleCallback>>>,
        pub opens: Arc<Mutex<usize>>,
    }

    impl FakeTap {
        /// Push samples as if the device produced them. No-op once released.
        pub fn push(&self, samples: &[f32]) {
            let mut guard = self.callback.lock().unwrap_or_else(|e| panic!("{e}"));
            if let Some(cb) = guard.as_mut() {
                cb(samples);
            }
        }

        pub fn is_open(&self) -> bool {
            self.callback
                .lock()
                .unwrap_or_else(|e| panic!("{e}"))
                .is_some()
        }
    }

    pub enum FakeMode {
        Working,
        Denied,
        NoDevice,
        /// Opens, but reports a format the pipeline cannot convert.
        ZeroChannels,
    }

    pub struct FakeMicrophone {
        pub mode: FakeMode,
        pub tap: FakeTap,
    }

    impl FakeMicrophone {
        pub fn new(mode: FakeMode) -> (Self, FakeTap) {
            let tap = FakeTap::default();
            (
                Self {
                    mode,
                    tap: tap.clone(),
                },
                tap,
            )
        }
    }

    struct FakeInput {
        tap: FakeTap,
        channels: u16,
    }

    impl ActiveInput for FakeInput {
        fn sample_rate(&self) -> u32 {
            16000
        }

        fn channels(&self) -> u16 {
            self.channels
        }
    }

    impl Drop for FakeInput {
        fn drop(&mut self) {
            // Dropping the callback closes the raw channel, like a real stream.
            *self.tap.callback.lock().unwrap_or_else(|e| panic!("{e}")) = None;
        }
    }

    impl Microphone for FakeMicrophone {
        fn open(&mut self, on_samples: SampleCallback) -> Result<Box<dyn ActiveInput>> {
            match self.mode {
                FakeMode::Denied => Err(ChimeError::Permission("user refused".to_string())),
                FakeMode::NoDevice => {
                    Err(ChimeError::Device("no default input device available".to_string()))
                }
                FakeMode::Working | FakeMode::ZeroChannels => {
                    *self.tap.callback.lock().unwrap_or_else(|e| panic!("{e}")) =
                        Some(on_samples);
                    *self.tap.opens.lock().unwrap_or_else(|e| panic!("{e}")) += 1;
                    let channels = u16::from(matches!(self.mode, FakeMode::Working));
                    Ok(Box::new(FakeInput {
                        tap: self.tap.clone(),
                        channels,
                    }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::{FakeMicrophone, FakeMode};
    use super::*;
    use crate::error::ChimeError;

    #[tokio::test]
    async fn frames_flow_while_capturing() {
        let (tx, mut rx) = mpsc::channel(16);
        let (mic, tap) = FakeMicrophone::new(FakeMode::Working);
        let mut pipeline = CapturePipeline::new(Box::new(mic), 4096, tx);

        assert!(pipeline.start().unwrap_or_else(|e| panic!("{e}")));
        tap.push(&vec![0.25f32; 4096 * 2]);

        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap_or_else(|e| panic!("{e}"))
                .unwrap_or_else(|| panic!("channel closed"));
            assert_eq!(frame.samples.len(), 4096);
            assert!(pipeline.accepts(&frame));
        }
    }

    #[tokio::test]
    async fn start_twice_is_noop() {
        let (tx, _rx) = mpsc::channel(16);
        let (mic, tap) = FakeMicrophone::new(FakeMode::Working);
        let mut pipeline = CapturePipeline::new(Box::new(mic), 4096, tx);

        assert!(pipeline.start().unwrap_or_else(|e| panic!("{e}")));
        let epoch = pipeline.epoch();
        assert!(!pipeline.start().unwrap_or_else(|e| panic!("{e}")));
        assert_eq!(pipeline.epoch(), epoch);
        assert_eq!(*tap.opens.lock().unwrap_or_else(|e| panic!("{e}")), 1);
    }

    #[tokio::test]
    async fn denied_start_leaves_no_state() {
        let (tx, _rx) = mpsc::channel(16);
        let (mic, _tap) = FakeMicrophone::new(FakeMode::Denied);
        let mut pipeline = CapturePipeline::new(Box::new(mic), 4096, tx);

        let err = pipeline.start().unwrap_err();
        assert!(matches!(err, ChimeError::Permission(_)));
        assert!(!pipeline.is_capturing());
        assert_eq!(pipeline.epoch(), 0);
    }

    #[tokio::test]
    async fn unusable_input_format_is_a_device_error() {
        let (tx, _rx) = mpsc::channel(16);
        let (mic, tap) = FakeMicrophone::new(FakeMode::ZeroChannels);
        let mut pipeline = CapturePipeline::new(Box::new(mic), 4096, tx);

        let err = pipeline.start().unwrap_err();
        assert!(matches!(err, ChimeError::Device(_)), "got {err:?}");
        assert!(err.is_user_facing());
        assert!(!pipeline.is_capturing());
        assert_eq!(pipeline.epoch(), 0);
        assert!(!tap.is_open());
    }

    #[tokio::test]
    async fn stop_releases_device_and_stales_frames() {
        let (tx, mut rx) = mpsc::channel(16);
        let (mic, tap) = FakeMicrophone::new(FakeMode::Working);
        let mut pipeline = CapturePipeline::new(Box::new(mic), 4096, tx);

        pipeline.start().unwrap_or_else(|e| panic!("{e}"));
        tap.push(&vec![0.0f32; 4096]);
        let in_flight = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap_or_else(|e| panic!("{e}"))
            .unwrap_or_else(|| panic!("channel closed"));

        assert!(pipeline.stop());
        assert!(!tap.is_open());
        assert!(!pipeline.accepts(&in_flight));

        // Second stop is a no-op.
        assert!(!pipeline.stop());

        // A restart gets a fresh epoch; the old frame stays stale.
        pipeline.start().unwrap_or_else(|e| panic!("{e}"));
        assert!(!pipeline.accepts(&in_flight));
    }
}
