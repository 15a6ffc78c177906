//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating the challenge configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("a necessary environment variable was not set: ${0}")]
    Missing(&'static str),

    #[error("${var}: couldn't convert value to integer: {value}")]
    InvalidInteger { var: &'static str, value: String },

    #[error("${var}: invalid duration: {value}")]
    InvalidDuration { var: &'static str, value: String },

    #[error("${var}: invalid socket address: {value}")]
    InvalidAddress { var: &'static str, value: String },

    #[error("challenge port must be 1-65535, got {0}")]
    PortOutOfRange(i64),

    #[error("${var} must be at least {min}, got {value}")]
    TooSmall {
        var: &'static str,
        min: u64,
        value: u64,
    },

    #[error("${var} must be at most {max}s, got {value}s")]
    TooLarge {
        var: &'static str,
        max: u64,
        value: u64,
    },
}

/// Why a team id can't be turned into cluster resource names.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenantKeyError {
    #[error("team id has no alphanumeric characters")]
    NoAlphanumerics,

    #[error("resource group name would be {len} characters, the limit is {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("team id is not a valid label value")]
    InvalidLabelValue,
}
