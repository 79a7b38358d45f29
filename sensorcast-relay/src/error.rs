//! Error types for the relay.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias using [`RelayError`].
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that stop a relay component.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The viewer listener could not be bound.
    #[error("Failed to bind viewer listener to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The viewer server failed while running.
    #[error("Viewer server error: {0}")]
    Server(#[from] std::io::Error),
}

impl From<sensorcast_common::Error> for RelayError {
    fn from(err: sensorcast_common::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<crate::config::ConfigError> for RelayError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
