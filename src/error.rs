//! Error types.
//!
//! Channel and decoding failures are contained inside a sensor reader and
//! only ever surface as an errored reading, so a
//! [`DecodeError`](crate::core::DecodeError) never becomes an [`Error`].
//! Configuration failures are returned to the caller before any reader
//! starts.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to open channel on {port}: {source}")]
    ChannelOpen {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bus protocol error: {0}")]
    BusProtocol(#[from] BusError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(&'static str),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

/// Failure of a single register bus exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Device exception: {0}")]
    Exception(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Expected {expected} registers, received {actual}")]
    Malformed { expected: u16, actual: usize },
}
