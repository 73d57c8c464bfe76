//! Real-time duplex voice sessions.
//!
//! A [`VoiceSession`] captures microphone audio, forwards it to a remote
//! conversational endpoint, schedules the synthesized replies for gapless
//! playback and recovers from transient transport failures.

pub mod audio;
pub mod config;
pub mod session;
pub mod testing;
pub mod transport;

pub use audio::AudioLevels;
pub use config::SessionConfig;
pub use session::{
    CommandHandler, SessionEvent, TerminalError, VoiceSession, VoiceSessionBuilder, VoiceState,
};

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RealtalkError {
    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Command handler error: {0}")]
    CommandError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for RealtalkError {
    fn from(e: std::io::Error) -> Self {
        RealtalkError::IOError(e.to_string())
    }
}

impl RealtalkError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Hardware and permission failures need the user
            RealtalkError::AudioDeviceError(_) => false,
            RealtalkError::PermissionDenied(_) => false,
            // The reconnection controller retries these
            RealtalkError::TransportError(_) => true,
            // Only the offending field is dropped
            RealtalkError::ProtocolError(_) => true,
            RealtalkError::CodecError(_) => true,
            RealtalkError::CommandError(_) => true,
            RealtalkError::ConfigError(_) => false,
            RealtalkError::IOError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            RealtalkError::AudioDeviceError(_) => {
                "Audio device error. Please check your microphone/speakers.".to_string()
            }
            RealtalkError::PermissionDenied(_) => {
                "Microphone access was denied.".to_string()
            }
            RealtalkError::TransportError(_) => {
                "Connection to the voice service was interrupted.".to_string()
            }
            RealtalkError::ProtocolError(_) => {
                "Received an unexpected message from the voice service.".to_string()
            }
            RealtalkError::CodecError(_) => "Audio data could not be decoded.".to_string(),
            RealtalkError::CommandError(_) => "A voice command failed to run.".to_string(),
            RealtalkError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            RealtalkError::IOError(_) => "File system error occurred.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RealtalkError>;
