//! hopline configuration

use crate::error::ConfigError;
use crate::stream::DEFAULT_CHANNEL_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default relay ping timeout in milliseconds
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 300;

/// Default upper bound of the ICE server registry
pub const MAX_STUN_SERVERS: usize = 23;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoplineConfig {
    /// Relay sub-protocol settings
    #[serde(default)]
    pub relay: RelayConfig,
    /// Direct channel / ICE settings
    #[serde(default)]
    pub ice: IceSettings,
}

/// Relay sub-protocol settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    /// Liveness probe timeout
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Buffer size of internal message channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl RelayConfig {
    /// Ping timeout as a [`Duration`]
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// ICE server registry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceSettings {
    /// Maximum number of STUN servers kept
    #[serde(default = "default_max_stun_servers")]
    pub max_stun_servers: usize,

    /// Addresses known before any discovery, e.g. bootstrap relays
    #[serde(default)]
    pub initial_servers: Vec<String>,
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            max_stun_servers: MAX_STUN_SERVERS,
            initial_servers: Vec::new(),
        }
    }
}

fn default_ping_timeout_ms() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_max_stun_servers() -> usize {
    MAX_STUN_SERVERS
}

impl HoplineConfig {
    /// Parse from a TOML string. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on malformed TOML or out-of-range values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "relay.channel_capacity must be > 0".to_string(),
            ));
        }
        if self.relay.ping_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.ping_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.ice.max_stun_servers == 0 {
            return Err(ConfigError::Invalid(
                "ice.max_stun_servers must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
