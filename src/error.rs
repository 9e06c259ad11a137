//! Error types for the Warden service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
