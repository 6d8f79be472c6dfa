//! Error types for the events crate.

use thiserror::Error;

/// Result type alias for event bus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event bus error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An event type with this name was registered earlier.
    #[error("event type '{name}' is already registered")]
    AlreadyRegistered { name: String },

    /// Descriptor rejected before registration.
    #[error("invalid event type descriptor: {reason}")]
    InvalidDescriptor { reason: String },
}

impl Error {
    /// Create an already-registered error.
    pub fn already_registered(name: impl Into<String>) -> Self {
        Self::AlreadyRegistered { name: name.into() }
    }

    /// Create an invalid descriptor error.
    pub fn invalid_descriptor(reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            reason: reason.into(),
        }
    }
}
