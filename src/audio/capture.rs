use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};

use crate::config::AudioConfig;
use crate::error::{ChimeError, Result};

/// Callback invoked from the audio thread with interleaved device samples.
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A running input stream. Dropping it releases the device.
pub trait ActiveInput {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
}

/// Something that can hand out exclusive microphone streams.
pub trait Microphone {
    /// Open and start the device. Must not retain anything on failure.
    fn open(&mut self, on_samples: SampleCallback) -> Result<Box<dyn ActiveInput>>;
}

/// Microphone backed by the default cpal host.
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
        }
    }

    fn device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();

        if let Some(ref name) = self.device_name {
            return host
                .input_devices()
                .map_err(|e| ChimeError::Device(format!("failed to enumerate input devices: {e}")))?
                .find(|d| device_name(d).as_deref() == Some(name.as_str()))
                .ok_or_else(|| ChimeError::Device(format!("input device not found: {name}")));
        }

        host.default_input_device()
            .ok_or_else(|| ChimeError::Device("no default input device available".to_string()))
    }
}

impl Microphone for CpalMicrophone {
    fn open(&mut self, mut on_samples: SampleCallback) -> Result<Box<dyn ActiveInput>> {
        let device = self.device()?;

        let supported = device.default_input_config().map_err(|e| {
            classify(&e.to_string(), "failed to get default input config")
        })?;

        let sample_rate = supported.sample_rate();
        let channels = supported.channels();

        let stream_config = StreamConfig {
            channels,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let err_fn = |err: cpal::StreamError| {
            tracing::error!("audio input stream error: {err}");
        };

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| on_samples(data),
                err_fn,
                None,
            )
            .map_err(|e| classify(&e.to_string(), "failed to build input stream"))?;

        stream
            .play()
            .map_err(|e| classify(&e.to_string(), "failed to start input stream"))?;

        tracing::info!(
            "microphone open: {}Hz, {} channel(s)",
            sample_rate,
            channels
        );

        Ok(Box::new(CpalInput {
            _stream: stream,
            sample_rate,
            channels,
        }))
    }
}

struct CpalInput {
    _stream: Stream,
    sample_rate: u32,
    channels: u16,
}

impl ActiveInput for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

/// Backends report a refused microphone as a generic backend error; sort
/// those into `Permission` so the user gets a retryable message.
fn classify(message: &str, context: &str) -> ChimeError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        ChimeError::Permission(format!("{context}: {message}"))
    } else {
        ChimeError::Device(format!("{context}: {message}"))
    }
}

pub(crate) fn device_name(device: &cpal::Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}

/// Names of all input devices on the default host.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| ChimeError::Device(format!("failed to enumerate input devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_input_device_name() -> Option<String> {
    cpal::default_host()
        .default_input_device()
        .and_then(|d| device_name(&d))
}
