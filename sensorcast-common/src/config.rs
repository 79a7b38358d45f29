use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::broker::{BrokerAddress, parse_broker};
use crate::error::{Error, Result};

/// MQTT upstream connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker address: "host", "host:port" or "mqtt://host[:port]".
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Topic carrying sensor messages.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Prefix for the generated client identifier.
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// How long a single connection attempt may take (milliseconds).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Fixed delay between reconnection attempts (milliseconds).
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// MQTT keep-alive interval (seconds).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_broker() -> String {
    "mqtt://broker.emqx.io:1883".to_string()
}

fn default_topic() -> String {
    "emqx/esp8266/sensor".to_string()
}

fn default_client_id_prefix() -> String {
    "mqtt_".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    4000
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_keep_alive_secs() -> u64 {
    30
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            topic: default_topic(),
            client_id_prefix: default_client_id_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl MqttConfig {
    /// Parse the configured broker address.
    pub fn broker_address(&self) -> Result<BrokerAddress> {
        parse_broker(&self.broker)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}
