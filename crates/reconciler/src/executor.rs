//! Deployment executor: brings a unit directory up or down.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Runs the container tooling for a unit directory.
#[async_trait]
pub trait DeploymentExecutor: Send + Sync {
    /// Bring the unit up with `env` applied, removing orphaned services.
    async fn up(&self, unit_path: &Path, env: &BTreeMap<String, String>) -> Result<()>;

    /// Tear the unit down, removing orphaned services.
    async fn down(&self, unit_path: &Path) -> Result<()>;
}

const STDERR_TAIL: usize = 512;

/// [`DeploymentExecutor`] driving `docker compose` (or any compatible CLI).
#[derive(Debug, Clone)]
pub struct ComposeExecutor {
    program: String,
    base_args: Vec<String>,
}

impl Default for ComposeExecutor {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            base_args: vec!["compose".to_string()],
        }
    }
}

impl ComposeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another program, e.g. `podman` with `["compose"]`.
    pub fn with_program(
        program: impl Into<String>,
        base_args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            base_args: base_args.into_iter().map(Into::into).collect(),
        }
    }

    async fn run(
        &self,
        operation: &str,
        args: &[&str],
        unit_path: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        debug!(
            program = %self.program,
            operation,
            unit_path = %unit_path.display(),
            "Running executor"
        );

        let output = Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .current_dir(unit_path)
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::executor(operation, unit_path, e))?;

        if output.status.success() {
            info!(operation, unit_path = %unit_path.display(), "Executor finished");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .and_then(|(i, _)| stderr.get(i..))
            .unwrap_or(stderr);
        Err(Error::executor(
            operation,
            unit_path,
            format!("{}: {tail}", output.status),
        ))
    }
}

#[async_trait]
impl DeploymentExecutor for ComposeExecutor {
    async fn up(&self, unit_path: &Path, env: &BTreeMap<String, String>) -> Result<()> {
        self.run("up", &["up", "-d", "--remove-orphans"], unit_path, env)
            .await
    }

    async fn down(&self, unit_path: &Path) -> Result<()> {
        self.run("down", &["down", "--remove-orphans"], unit_path, &BTreeMap::new())
            .await
    }
}
