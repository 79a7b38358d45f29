//! SensorCast Common Library
//!
//! Shared types and utilities for the SensorCast relay:
//!
//! - [`record`] - The relayed sensor record (`Record`)
//! - [`broker`] - Broker address parsing and client identifiers
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`error`] - Error types

pub mod broker;
pub mod config;
pub mod error;
pub mod record;

// Re-export commonly used types at the crate root
pub use broker::{BrokerAddress, DEFAULT_MQTT_PORT, generate_client_id, parse_broker};
pub use config::{LogFormat, LoggingConfig, MqttConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use record::{Record, current_timestamp_iso};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
