//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// An upstream connection could not be established.
    #[error("Connection creation failed: {0}")]
    ConnectionCreation(String),

    /// An upstream connection failed while being torn down.
    #[error("Close failed: {0}")]
    Close(String),

    /// A raw upstream payload is missing required fields.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Upstream protocol parsing/encoding errors.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionCreation(msg.into())
    }

    pub fn close(msg: impl Into<String>) -> Self {
        Self::Close(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
