//! Error types for the Sluice service.

use thiserror::Error;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for SluiceError {
    fn from(err: ::config::ConfigError) -> Self {
        SluiceError::Config(err.to_string())
    }
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;
