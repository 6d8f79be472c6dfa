//! Core error types for fleetsync.
//!
//! Configuration problems are the only errors in this crate; they are fatal at startup.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required configuration '{key}'")]
    MissingConfig { key: String },

    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("YAML parse error: {reason}")]
    YamlParseFailed { reason: String },

    #[error("invalid unit identity '{value}': expected owner/name")]
    InvalidUnitId { value: String },
}

impl Error {
    /// Create a missing configuration error.
    pub fn missing_config(key: impl Into<String>) -> Self {
        Self::MissingConfig { key: key.into() }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a YAML parse error.
    pub fn yaml_parse_failed(reason: impl Into<String>) -> Self {
        Self::YamlParseFailed {
            reason: reason.into(),
        }
    }

    /// Whether this error must stop the process at startup.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingConfig { .. } | Self::InvalidConfig { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::missing_config("token");
        assert!(err.to_string().contains("token"));

        let err = Error::invalid_config("interval", "not a duration");
        assert!(err.to_string().contains("interval"));
        assert!(err.to_string().contains("not a duration"));
    }

    #[test]
    fn should_treat_only_configuration_errors_as_fatal() {
        assert!(Error::missing_config("users").is_fatal());
        assert!(Error::invalid_config("dry_run", "bad").is_fatal());
        assert!(!Error::yaml_parse_failed("bad indent").is_fatal());
    }
}
