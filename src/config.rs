use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ChimeError, Result};

/// Environment variable consulted when the config file carries no API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

fn default_model() -> String {
    "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string()
}

fn default_endpoint() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}

fn default_voice() -> String {
    "Orus".to_string()
}

fn default_system_instruction() -> String {
    "You are a friendly voice guide. Whenever the user asks about a direction, \
     location or where something is, you must first call the show_direction tool \
     with either \"left\" or \"right\", and only then explain your answer out loud."
        .to_string()
}

const fn default_frame_samples() -> usize {
    4096
}

const fn default_playback_sample_rate() -> u32 {
    24000
}

const fn default_display_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            endpoint: default_endpoint(),
            voice: default_voice(),
            system_instruction: default_system_instruction(),
            audio: AudioConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub input_device: Option<String>,

    pub output_device: Option<String>,

    /// Samples per outbound frame at 16kHz.
    #[serde(default = "default_frame_samples")]
    pub frame_samples: usize,

    #[serde(default = "default_playback_sample_rate")]
    pub playback_sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            frame_samples: default_frame_samples(),
            playback_sample_rate: default_playback_sample_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    /// How long the direction cue stays up before the tool response is sent.
    #[serde(default = "default_display_ms")]
    pub direction_display_ms: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            direction_display_ms: default_display_ms(),
        }
    }
}

/// Which audio device a config setting refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Input,
    Output,
}

impl DeviceKind {
    const fn field(self) -> &'static str {
        match self {
            Self::Input => "input_device",
            Self::Output => "output_device",
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ChimeError::Config(format!(
                "config file not found: {}; create it or pass --config",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            ChimeError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let mut config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            ChimeError::Config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        if config.api_key.is_none() {
            config.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults plus the
    /// API key from the environment.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        tracing::debug!("no config at {}, using defaults", path.display());
        let config = Self {
            api_key: std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.audio.frame_samples == 0 {
            return Err(ChimeError::Config(
                "audio.frame_samples must be greater than zero".to_string(),
            ));
        }
        if self.audio.playback_sample_rate == 0 {
            return Err(ChimeError::Config(
                "audio.playback_sample_rate must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The API key, or a config error naming both places it can come from.
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            ChimeError::Config(format!(
                "no API key: set api_key in the config file or {API_KEY_ENV} in the environment"
            ))
        })
    }

    /// Write `audio.<key>` into the config file at `path`, creating the file
    /// and its directory if needed. Other settings are preserved.
    pub fn set_audio_device(path: &Path, key: DeviceKind, name: &str) -> Result<()> {
        use serde_yaml_ng::{Mapping, Value};

        let mut root = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            match serde_yaml_ng::from_str::<Value>(&contents) {
                Ok(Value::Mapping(m)) => m,
                Ok(Value::Null) => Mapping::new(),
                Ok(_) => {
                    return Err(ChimeError::Config(format!(
                        "{} does not contain a mapping",
                        path.display()
                    )));
                }
                Err(e) => {
                    return Err(ChimeError::Config(format!(
                        "failed to parse config file {}: {e}",
                        path.display()
                    )));
                }
            }
        } else {
            Mapping::new()
        };

        let audio = root
            .entry(Value::String("audio".to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()))
            .as_mapping_mut()
            .ok_or_else(|| ChimeError::Config("audio section is not a mapping".to_string()))?;
        audio.insert(
            Value::String(key.field().to_string()),
            Value::String(name.to_string()),
        );

        let yaml = serde_yaml_ng::to_string(&root)
            .map_err(|e| ChimeError::Config(format!("failed to serialize config: {e}")))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, yaml)?;
        Ok(())
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join("chime/config.yaml")
    }

    /// Expand `~` in a path string to the user's home directory.
    #[must_use]
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        PathBuf::from(path)
    }
}
