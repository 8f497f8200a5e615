use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ChimeError {
    #[error("microphone permission denied: {0}")]
    Permission(String),

    #[error("input device error: {0}")]
    Device(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("audio error: {0}")]
    Audio(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl ChimeError {
    /// Errors that stop capture and are shown to the user, as opposed to
    /// ones absorbed by the component that hit them.
    #[must_use]
    pub const fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Permission(_) | Self::Device(_) | Self::Connection(_) | Self::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChimeError>;
