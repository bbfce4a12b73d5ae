//! Error types for the PAGI Live voice session

use thiserror::Error;

/// Result type alias for live voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in a live voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone or speaker could not be acquired (permission denied, busy, missing).
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The remote channel could not be opened.
    #[error("Channel open failed: {0}")]
    ChannelOpenFailed(String),

    /// The remote channel failed after it was opened.
    #[error("Channel error: {0}")]
    Channel(String),

    /// A single audio frame could not be decoded. Never fatal to the session.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Operation invoked after teardown.
    #[error("Session closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Whether this error ends the session (everything except a dropped frame).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VoiceError::Decode(_))
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<rodio::StreamError> for VoiceError {
    fn from(err: rodio::StreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<rodio::PlayError> for VoiceError {
    fn from(err: rodio::PlayError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Channel(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Channel(format!("malformed message: {}", err))
    }
}
