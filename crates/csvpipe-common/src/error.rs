//! Error types for ambient settings

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while reading ambient process settings
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("invalid value '{value}' for {setting}")]
    InvalidSetting { setting: &'static str, value: String },

    #[error("invalid log filter directive '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to install global subscriber: {0}")]
    Subscriber(String),
}

impl CommonError {
    pub fn invalid(setting: &'static str, value: impl Into<String>) -> Self {
        CommonError::InvalidSetting {
            setting,
            value: value.into(),
        }
    }
}
