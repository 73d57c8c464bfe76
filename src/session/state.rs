use crate::audio::AudioLevels;
use crate::session::reconnect::ReconnectController;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Conversational state of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoiceState {
    /// No session
    #[default]
    Idle,
    /// Connected, nothing queued for playback
    Listening,
    /// Reserved for a completed turn still awaiting audio. Never produced.
    Thinking,
    /// At least one playback buffer is queued or playing
    Speaking,
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoiceState::Idle => "idle",
            VoiceState::Listening => "listening",
            VoiceState::Thinking => "thinking",
            VoiceState::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// The two failures a user ever sees
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TerminalError {
    /// Audio devices could not be acquired
    #[error("Failed to initialize audio session")]
    Initialization(String),

    /// Reconnection gave up
    #[error("System Unreachable")]
    Unreachable { retries: u32 },
}

impl TerminalError {
    /// Underlying cause, for logs
    pub fn detail(&self) -> String {
        match self {
            TerminalError::Initialization(detail) => detail.clone(),
            TerminalError::Unreachable { retries } => {
                format!("transport failed after {} reconnection attempts", retries)
            }
        }
    }
}

/// Observable changes, delivered in order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    VoiceStateChanged(VoiceState),
    MuteChanged(bool),
    /// Throttled level sample
    Levels(AudioLevels),
    Error(TerminalError),
    Disconnected,
}

/// Authoritative session state.
///
/// Every continuation that resumes after a suspension point checks
/// [`SessionState::is_current`] with the generation it was started under
/// before touching anything else.
pub(crate) struct SessionState {
    /// The user wants to be connected
    pub intent: bool,
    /// Bumped on every teardown; stale continuations compare against it
    pub generation: u64,
    /// Warm-up elapsed; capture may be forwarded
    pub ready: bool,
    pub muted: bool,
    pub connected: bool,
    pub voice_state: VoiceState,
    pub retry: ReconnectController,
    pub last_error: Option<TerminalError>,
    /// Last published (throttled) levels
    pub levels: AudioLevels,
    pub live_levels: AudioLevels,
}

impl SessionState {
    pub fn new(retry: ReconnectController) -> Self {
        Self {
            intent: false,
            generation: 0,
            ready: false,
            muted: false,
            connected: false,
            voice_state: VoiceState::Idle,
            retry,
            last_error: None,
            levels: AudioLevels::SILENT,
            live_levels: AudioLevels::SILENT,
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.intent && self.generation == generation
    }

    /// Invalidate every continuation of the current pipeline
    pub fn advance_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_terminal_messages() {
        assert_eq!(
            TerminalError::Initialization("no mic".into()).to_string(),
            "Failed to initialize audio session"
        );
        assert_eq!(
            TerminalError::Unreachable { retries: 3 }.to_string(),
            "System Unreachable"
        );
        assert!(TerminalError::Unreachable { retries: 3 }.detail().contains('3'));
    }

    #[test]
    fn test_generation_invalidates() {
        let mut state = SessionState::new(ReconnectController::new(3, Duration::from_secs(1)));
        assert!(!state.is_current(0));

        state.intent = true;
        assert!(state.is_current(0));

        let next = state.advance_generation();
        assert!(!state.is_current(0));
        assert!(state.is_current(next));
    }
}
