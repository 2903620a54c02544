//! RPC client for the embedding worker
//!
//! Sequences command/response exchanges with the worker process, tracks the
//! active model and hides process management from the front ends.

pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use session::{ClientOptions, EmbedClient, Embedded, ModelState};

use std::time::Duration;

/// Embedding vector type
pub type Embedding = Vec<f32>;

/// Result type for client operations
pub type EmbedResult<T> = Result<T, EmbedError>;

/// Errors that can occur while talking to the embedding worker
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("Worker launch failed: {message}")]
    LaunchError { message: String },

    #[error("Worker initialization failed: {message}")]
    InitError { message: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Worker error: {message}")]
    RpcError { message: String },

    #[error("Worker did not answer within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Worker session unavailable: {reason}")]
    SessionUnavailable { reason: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("IO error: {error}")]
    IoError { error: std::io::Error },

    #[error("TOML parsing error: {error}")]
    TomlError { error: toml::de::Error },
}

impl EmbedError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        EmbedError::ProtocolError { message: message.into() }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        EmbedError::InvalidInput { message: message.into() }
    }
}

impl From<std::io::Error> for EmbedError {
    fn from(error: std::io::Error) -> Self {
        EmbedError::IoError { error }
    }
}

impl From<toml::de::Error> for EmbedError {
    fn from(error: toml::de::Error) -> Self {
        EmbedError::TomlError { error }
    }
}
