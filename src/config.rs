//! Session configuration
//!
//! Every section has working defaults; a TOML file only needs the keys it
//! wants to change.

use crate::audio::AudioConfig;
use crate::{RealtalkError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Remote endpoint and conversation setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket URL of the streaming endpoint
    pub endpoint: String,

    /// Model requested in the setup message
    pub model: String,

    /// Prebuilt voice for synthesized replies
    pub voice: String,

    pub system_instruction: Option<String>,

    /// Outbound messages buffered before frames are dropped
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "models/gemini-2.0-flash-exp".to_string(),
            voice: "Puck".to_string(),
            system_instruction: None,
            outbound_capacity: 64,
        }
    }
}

/// Empirical timing constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between transport open and the first forwarded capture block
    pub warmup_ms: u64,

    /// Fixed delay before each reconnection attempt
    pub retry_backoff_ms: u64,

    /// Reconnection attempts per connect cycle
    pub max_retries: u32,

    pub meter_interval_ms: u64,

    /// Publish levels on every Nth meter tick
    pub meter_publish_every: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            warmup_ms: 500,
            retry_backoff_ms: 1000,
            max_retries: 3,
            meter_interval_ms: 16,
            meter_publish_every: 5,
        }
    }
}

impl TimingConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms.max(1))
    }
}

/// The single command the remote side may invoke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub name: String,
    pub description: String,

    /// Key of the string argument handed to the command handler
    pub argument: String,

    /// Fixed result sent back for every invocation
    pub ack_result: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            name: "generate_system".to_string(),
            description: "Start generating a new system from a spoken description".to_string(),
            argument: "description".to_string(),
            ack_result: "ok".to_string(),
        }
    }
}

/// Configuration for a voice session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    pub timing: TimingConfig,

    /// Declared to the remote side in the setup message. Defaults to
    /// `generate_system`; `None` declares no command at all.
    pub command: Option<CommandConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            transport: TransportConfig::default(),
            timing: TimingConfig::default(),
            command: Some(CommandConfig::default()),
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            RealtalkError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            RealtalkError::ConfigError(msg) => {
                RealtalkError::ConfigError(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RealtalkError::ConfigError(e.to_string()))
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.transport.endpoint = endpoint.into();
        self
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.timing.warmup_ms = duration_millis(warmup);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.timing.retry_backoff_ms = duration_millis(backoff);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.timing.max_retries = max_retries;
        self
    }

    pub fn with_command(mut self, command: CommandConfig) -> Self {
        self.command = Some(command);
        self
    }

    pub fn without_command(mut self) -> Self {
        self.command = None;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(RealtalkError::ConfigError(msg.to_string()));

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return fail("Sample rates must be greater than 0");
        }
        if self.audio.capture_block_size == 0 {
            return fail("capture_block_size must be greater than 0");
        }
        if self.audio.analyser_window == 0 {
            return fail("analyser_window must be greater than 0");
        }
        if self.transport.outbound_capacity == 0 {
            return fail("outbound_capacity must be greater than 0");
        }
        if self.timing.meter_publish_every == 0 {
            return fail("meter_publish_every must be greater than 0");
        }
        if let Some(command) = &self.command {
            if command.name.is_empty() || command.argument.is_empty() {
                return fail("command name and argument are required");
            }
        }

        Ok(())
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
