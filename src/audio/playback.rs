use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};

use crate::audio::capture::device_name;
use crate::audio::codec::AudioBuffer;
use crate::audio::scheduler::{AudioSink, CompletionFn, EntryId};
use crate::config::AudioConfig;
use crate::error::{ChimeError, Result};

struct Voice {
    id: EntryId,
    samples: Vec<f32>,
    start_frame: u64,
    on_complete: Option<CompletionFn>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Default)]
struct Mixer {
    frames_played: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    /// Fill `out` (mono) and advance the clock. Returns completions to fire
    /// once the lock is released.
    fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<CompletionFn> {
        let frames = out.len() / channels.max(1);
        for i in 0..frames {
            let frame = self.frames_played + i as u64;
            let mut sum = 0.0f32;
            for voice in &self.voices {
                if frame >= voice.start_frame && frame < voice.end_frame() {
                    sum += voice.samples[(frame - voice.start_frame) as usize];
                }
            }
            let value = sum.clamp(-1.0, 1.0);
            for c in 0..channels {
                out[i * channels + c] = value;
            }
        }
        self.frames_played += frames as u64;

        let now = self.frames_played;
        let mut finished = Vec::new();
        self.voices.retain_mut(|voice| {
            if voice.end_frame() <= now {
                if let Some(cb) = voice.on_complete.take() {
                    finished.push(cb);
                }
                false
            } else {
                true
            }
        });
        finished
    }
}

/// Audio playback to the system speakers via cpal. One output stream mixes
/// the scheduled buffers, and its frame counter is the output clock.
pub struct CpalPlayback {
    _stream: Stream,
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
}

impl CpalPlayback {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| ChimeError::Audio(format!("failed to enumerate output devices: {e}")))?
                .find(|d| device_name(d).as_deref() == Some(name.as_str()))
                .ok_or_else(|| ChimeError::Audio(format!("output device not found: {name}")))?
        } else {
            host.default_output_device().ok_or_else(|| {
                ChimeError::Audio("no default output device available".to_string())
            })?
        };

        let sample_rate = config.playback_sample_rate;
        let stream_config = StreamConfig {
            channels: 1,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let render_mixer = Arc::clone(&mixer);

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let finished = match render_mixer.lock() {
                        Ok(mut m) => m.render(data, 1),
                        Err(_) => {
                            data.fill(0.0);
                            return;
                        }
                    };
                    for cb in finished {
                        cb();
                    }
                },
                |err| {
                    tracing::error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| ChimeError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| ChimeError::Audio(format!("failed to start output stream: {e}")))?;

        tracing::info!("playback open at {sample_rate}Hz mono");

        Ok(Self {
            _stream: stream,
            mixer,
            sample_rate,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Mixer>> {
        self.mixer
            .lock()
            .map_err(|e| ChimeError::Audio(format!("playback mixer lock poisoned: {e}")))
    }
}

impl AudioSink for CpalPlayback {
    fn current_time(&self) -> f64 {
        self.lock().map_or(0.0, |m| {
            m.frames_played as f64 / f64::from(self.sample_rate)
        })
    }

    fn start(
        &mut self,
        id: EntryId,
        buffer: AudioBuffer,
        at: f64,
        on_complete: CompletionFn,
    ) -> Result<()> {
        let samples = to_output_format(&buffer, self.sample_rate);
        let start_frame = (at * f64::from(self.sample_rate)).round().max(0.0) as u64;

        self.lock()?.voices.push(Voice {
            id,
            samples,
            start_frame,
            on_complete: Some(on_complete),
        });
        Ok(())
    }

    fn stop(&mut self, id: EntryId) {
        match self.lock() {
            Ok(mut m) => m.voices.retain(|v| v.id != id),
            Err(e) => tracing::warn!("failed to stop entry {id}: {e}"),
        }
    }
}

/// Names of all output devices on the default host.
pub fn list_output_devices() -> Result<Vec<String>> {
    let devices = cpal::default_host()
        .output_devices()
        .map_err(|e| ChimeError::Audio(format!("failed to enumerate output devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_output_device_name() -> Option<String> {
    cpal::default_host()
        .default_output_device()
        .and_then(|d| device_name(&d))
}

/// Downmix to mono and, if the rates differ, linearly interpolate to `rate`.
fn to_output_format(buffer: &AudioBuffer, rate: u32) -> Vec<f32> {
    let ch = buffer.channels.max(1) as usize;
    let mono: Vec<f32> = if ch == 1 {
        buffer.samples.clone()
    } else {
        buffer
            .samples
            .chunks_exact(ch)
            .map(|f| f.iter().sum::<f32>() / ch as f32)
            .collect()
    };

    if buffer.sample_rate == rate || mono.is_empty() {
        return mono;
    }

    let ratio = f64::from(buffer.sample_rate) / f64::from(rate);
    let out_len = (mono.len() as f64 / ratio).round() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = mono[idx.min(mono.len() - 1)];
            let b = mono[(idx + 1).min(mono.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}
