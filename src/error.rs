//! Error types for the call session engine

use thiserror::Error;

/// Result type alias for call session operations
pub type CallResult<T> = Result<T, CallError>;

/// Errors that can occur while driving a call session
#[derive(Error, Debug)]
pub enum CallError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio device busy")]
    DeviceBusy,

    #[error("recording produced no audio")]
    EmptyRecording,

    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("reasoning failed: {0}")]
    ReasoningFailed(String),

    #[error("playback failed: {0}")]
    PlaybackFailed(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for CallError {
    fn from(err: cpal::DevicesError) -> Self {
        CallError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for CallError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        CallError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for CallError {
    fn from(err: cpal::BuildStreamError) -> Self {
        CallError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for CallError {
    fn from(err: cpal::PlayStreamError) -> Self {
        CallError::AudioStream(err.to_string())
    }
}
