//! Voice session lifecycle: intent, provisioning, reconnection, commands

pub mod commands;
pub mod orchestrator;
pub mod reconnect;
pub mod state;

pub use commands::CommandHandler;
pub use orchestrator::{VoiceSession, VoiceSessionBuilder};
pub use reconnect::{ReconnectController, ReconnectState, RetryDecision};
pub use state::{SessionEvent, TerminalError, VoiceState};
