//! Error types for pubsub-bench-core

use thiserror::Error;

use crate::config::ConfigError;
use crate::destination::DestinationError;
use crate::transport::TransportError;

/// Core error type
///
/// Any error returned before workers are spawned is fatal for the run.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A required builder field was not provided
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// Destination template could not be expanded
    #[error(transparent)]
    Destination(#[from] DestinationError),

    /// Transport setup failed (connect, subscribe, producer creation)
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Worker error
    #[error("worker error: {0}")]
    Worker(String),

    /// Orchestration error (join failures and the like)
    #[error("orchestration error: {0}")]
    Orchestration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BenchError {
    /// Configuration error with a message
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// A builder field was left unset
    pub fn missing_config(field: &'static str) -> Self {
        Self::MissingConfig(field)
    }

    /// Worker failure with a message
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker(message.into())
    }

    /// Orchestration failure with a message
    pub fn orchestration(message: impl Into<String>) -> Self {
        Self::Orchestration(message.into())
    }
}

impl From<ConfigError> for BenchError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias
pub type BenchResult<T> = std::result::Result<T, BenchError>;
