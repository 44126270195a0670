//! Error types for pirate-metrics-core

use thiserror::Error;

/// Main error type for the pirate-metrics-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Config file could not be parsed
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller-supplied payload could not be normalized into records
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The collector could not be reached at all (refused, DNS, unreachable)
    #[error("unable to connect to collector: {0}")]
    Connect(String),

    /// The collector answered with a non-2xx status
    #[error("collector returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Any other transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Worker runtime or thread could not be created
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// True for the "connection refused" class of failures, which the
    /// worker reports quietly.
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::Connect(_))
    }
}

/// Result type alias for pirate-metrics-core
pub type Result<T> = std::result::Result<T, Error>;
