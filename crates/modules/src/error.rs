//! Error types for the module system.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for module operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Module system error types.
#[derive(Debug, Error)]
pub enum Error {
    /// An extension manifest could not be turned into a module.
    #[error("failed to load extension from '{path}': {reason}")]
    Load { path: PathBuf, reason: String },

    /// A registered module failed `init`. Fatal at startup.
    #[error("module '{module}' failed to initialize: {reason}")]
    Init { module: String, reason: String },

    #[error("module '{module}' failed to start: {reason}")]
    Start { module: String, reason: String },

    #[error("module '{module}' failed to stop: {reason}")]
    Stop { module: String, reason: String },

    #[error("a module named '{name}' is already registered")]
    DuplicateName { name: String },

    #[error("unknown extension kind '{kind}'")]
    UnknownKind { kind: String },

    #[error("plugin '{plugin}' does not support action '{action}'")]
    UnsupportedAction { plugin: String, action: String },

    /// A plugin action ran and failed.
    #[error("plugin '{plugin}' action '{action}' failed: {reason}")]
    Execute {
        plugin: String,
        action: String,
        reason: String,
    },

    #[error("invalid action parameters: {reason}")]
    InvalidParams { reason: String },

    #[error("route '{path}' rejected: {reason}")]
    Route { path: String, reason: String },

    #[error("HTTP client setup failed: {reason}")]
    HttpClient { reason: String },

    #[error(transparent)]
    Config(#[from] fleetsync_core::Error),

    #[error(transparent)]
    Events(#[from] fleetsync_events::Error),

    #[error("HTTP server error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an extension load error.
    pub fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Load {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a module init error.
    pub fn init(module: impl Into<String>, reason: impl ToString) -> Self {
        Self::Init {
            module: module.into(),
            reason: reason.to_string(),
        }
    }

    pub fn start(module: impl Into<String>, reason: impl ToString) -> Self {
        Self::Start {
            module: module.into(),
            reason: reason.to_string(),
        }
    }

    pub fn stop(module: impl Into<String>, reason: impl ToString) -> Self {
        Self::Stop {
            module: module.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unsupported_action(plugin: impl Into<String>, action: impl Into<String>) -> Self {
        Self::UnsupportedAction {
            plugin: plugin.into(),
            action: action.into(),
        }
    }

    /// Create a plugin action failure.
    pub fn execute(
        plugin: impl Into<String>,
        action: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Execute {
            plugin: plugin.into(),
            action: action.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }

    pub fn route(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Route {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
