use thiserror::Error;

/// Common error type for SensorCast components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid broker address: {0}")]
    InvalidBroker(String),
}

/// Result type alias using SensorCast's Error.
pub type Result<T> = std::result::Result<T, Error>;
