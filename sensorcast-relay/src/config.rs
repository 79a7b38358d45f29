//! Configuration for the relay.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use sensorcast_common::config::{LoggingConfig, MqttConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upstream MQTT settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Viewer-facing server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// History buffer settings.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Per-viewer delivery settings.
    #[serde(default)]
    pub viewer: ViewerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP / WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// History buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Number of most recent records kept and sent to viewers.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    5
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Per-viewer send path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerConfig {
    /// Frames queued per viewer before new frames are dropped for it.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum time a single frame write may take (milliseconds).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    16
}

fn default_send_timeout_ms() -> u64 {
    5000
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl ViewerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl RelayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(e) = self.mqtt.broker_address() {
            return Err(ConfigError::Validation(e.to_string()));
        }

        if self.mqtt.topic.is_empty() {
            return Err(ConfigError::Validation("topic must not be empty".to_string()));
        }

        // One static topic only, no wildcard fan-in
        if self.mqtt.topic.contains(['+', '#']) {
            return Err(ConfigError::Validation(format!(
                "topic must not contain wildcards: {}",
                self.mqtt.topic
            )));
        }

        if self.mqtt.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.mqtt.reconnect_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "reconnect_interval_ms must be > 0".to_string(),
            ));
        }

        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::Validation(
                "keep_alive_secs must be >= 5".to_string(),
            ));
        }

        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.server.listen
            )));
        }

        if self.history.capacity == 0 {
            return Err(ConfigError::Validation(
                "history capacity must be > 0".to_string(),
            ));
        }

        if self.viewer.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "viewer queue_capacity must be > 0".to_string(),
            ));
        }

        if self.viewer.send_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "viewer send_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
