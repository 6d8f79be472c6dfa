//! Error types for the reconciler crate.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// Every variant is scoped to one query or one unit; none of them stops a cycle.
#[derive(Debug, Error)]
pub enum Error {
    /// The source provider failed or answered unexpectedly.
    #[error("source provider {operation} failed: {reason}")]
    Source { operation: String, reason: String },

    /// The deployment executor failed.
    #[error("executor '{operation}' failed in '{unit_path}': {reason}")]
    Executor {
        operation: String,
        unit_path: PathBuf,
        reason: String,
    },

    /// A hook script exited unsuccessfully or could not be spawned.
    #[error("{stage} hook '{script}' failed: {reason}")]
    HookFailed {
        stage: String,
        script: String,
        reason: String,
    },

    #[error("fetching {stage} hooks failed: {reason}")]
    HookFetchFailed { stage: String, reason: String },

    /// A secret provider failed; the unit is not deployed.
    #[error("secret provider '{plugin}' failed: {reason}")]
    SecretsFailed { plugin: String, reason: String },

    #[error("filesystem operation on '{path}' failed: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error(transparent)]
    Config(#[from] fleetsync_core::Error),

    #[error(transparent)]
    Module(#[from] fleetsync_modules::Error),
}

impl Error {
    /// Create a source provider error.
    pub fn source_failed(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Source {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an executor error.
    pub fn executor(
        operation: impl Into<String>,
        unit_path: impl Into<PathBuf>,
        reason: impl ToString,
    ) -> Self {
        Self::Executor {
            operation: operation.into(),
            unit_path: unit_path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn hook_failed(
        stage: impl Into<String>,
        script: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::HookFailed {
            stage: stage.into(),
            script: script.into(),
            reason: reason.to_string(),
        }
    }

    pub fn hook_fetch_failed(stage: impl Into<String>, reason: impl ToString) -> Self {
        Self::HookFetchFailed {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn secrets_failed(plugin: impl Into<String>, reason: impl ToString) -> Self {
        Self::SecretsFailed {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a local filesystem error.
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Whether the error aborted a deploy midway, leaving the unit to be retried.
    pub const fn is_pipeline_abort(&self) -> bool {
        matches!(
            self,
            Self::HookFailed { .. }
                | Self::HookFetchFailed { .. }
                | Self::SecretsFailed { .. }
                | Self::Executor { .. }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::source_failed("request", e)
    }
}
