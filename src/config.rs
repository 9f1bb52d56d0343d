use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stream::packet::PACKET_HEADER_BYTES;

/// Default BLE write size: 188-byte MTU minus the 3-byte ATT header.
pub const DEFAULT_MAX_WRITE_SIZE: usize = 185;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 10_000;

/// Error produced when channel configuration fails to load or validate.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Framing and link parameters shared by the streams and the caller's transport loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest single write the link accepts; packets are sized to it.
    pub max_write_size: usize,
    /// Upper bound on a reassembled logical message.
    pub max_message_size: usize,
    pub recv_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
        }
    }
}

impl ChannelConfig {
    /// Parses and validates a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Guarantees
    /// * A valid config leaves room for at least one payload byte per packet.
    /// * Reassembly is always bounded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_write_size <= PACKET_HEADER_BYTES {
            return Err(ConfigError::Invalid(format!(
                "max_write_size must exceed the {}-byte packet header, got {}",
                PACKET_HEADER_BYTES, self.max_write_size
            )));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be non-zero".into()));
        }
        if self.recv_timeout_ms == 0 {
            return Err(ConfigError::Invalid("recv_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}
