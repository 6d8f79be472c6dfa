//! Deploy pipeline for a single unit.
//!
//! Order of side effects:
//!
//! 1. fetch the descriptor (absent: nothing to do)
//! 2. compare with the local copy (equal: nothing to do)
//! 3. write the descriptor, then fetch the `pre` and `post` hooks
//! 4. aggregate secrets from `secrets`-capable plugins
//! 5. global `pre`, unit `pre`, executor `up`, unit `post`, global `post`
//!
//! Any failure up to and including `up` aborts the unit. A unit `post` failure
//! is only logged; a global `post` failure fails the unit.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fleetsync_core::UnitId;
use fleetsync_events::event::NOTIFY_SECRET_CONFLICT;
use fleetsync_events::{Event, EventBus};
use fleetsync_modules::Plugin;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor::DeploymentExecutor;
use crate::hooks::{self, HookContext};
use crate::secrets;
use crate::source::SourceProvider;
use crate::types::{DESCRIPTOR_FILE, DeployOutcome, EVENT_SOURCE, HookStage, RemoteUnit};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub target_dir: PathBuf,
    pub global_hooks_dir: Option<PathBuf>,
    pub dry_run: bool,
}

impl PipelineConfig {
    /// Local directory of a unit: `<target_dir>/<owner>/<name>`.
    pub fn unit_path(&self, unit: &UnitId) -> PathBuf {
        self.target_dir.join(unit.owner()).join(unit.name())
    }
}

pub struct DeployPipeline {
    source: Arc<dyn SourceProvider>,
    executor: Arc<dyn DeploymentExecutor>,
    secrets: Vec<Arc<dyn Plugin>>,
    bus: Arc<EventBus>,
    config: PipelineConfig,
    /// Units whose descriptor was written but whose last run did not finish.
    pending_retry: Mutex<BTreeSet<UnitId>>,
}

impl DeployPipeline {
    pub fn new(
        source: Arc<dyn SourceProvider>,
        executor: Arc<dyn DeploymentExecutor>,
        secrets: Vec<Arc<dyn Plugin>>,
        bus: Arc<EventBus>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            executor,
            secrets,
            bus,
            config,
            pending_retry: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn pending(&self) -> MutexGuard<'_, BTreeSet<UnitId>> {
        self.pending_retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Units that will be redeployed regardless of descriptor content.
    pub fn pending_retries(&self) -> Vec<UnitId> {
        self.pending().iter().cloned().collect()
    }

    /// Drop retry state for a unit that was pruned.
    pub fn forget(&self, unit: &UnitId) {
        self.pending().remove(unit);
    }

    /// Converge one desired unit.
    ///
    /// # Errors
    ///
    /// Source, filesystem, hook, secret and executor failures abort the unit.
    pub async fn deploy(&self, unit: &RemoteUnit) -> Result<DeployOutcome> {
        let id = &unit.id;
        let unit_path = self.config.unit_path(id);
        let descriptor_path = unit_path.join(DESCRIPTOR_FILE);

        let Some(content) = self.source.file_content(id, DESCRIPTOR_FILE).await? else {
            debug!(unit = %id, "No descriptor, skipping");
            return Ok(DeployOutcome::NoDescriptor);
        };

        let retry = self.pending().contains(id);
        if retry {
            info!(unit = %id, "Retrying unfinished deploy");
        } else if local_matches(&descriptor_path, &content).await? {
            debug!(unit = %id, "Descriptor unchanged");
            return Ok(DeployOutcome::Unchanged);
        }

        if self.config.dry_run {
            info!(unit = %id, path = %unit_path.display(), "Dry run: would deploy");
            return Ok(DeployOutcome::WouldDeploy);
        }

        info!(unit = %id, "Updating deployment");
        tokio::fs::create_dir_all(&unit_path)
            .await
            .map_err(|e| Error::io(&unit_path, &e))?;
        tokio::fs::write(&descriptor_path, &content)
            .await
            .map_err(|e| Error::io(&descriptor_path, &e))?;
        self.pending().insert(id.clone());

        self.run(id, &unit_path).await?;

        self.pending().remove(id);
        info!(unit = %id, "Deploy sequence complete");
        Ok(DeployOutcome::Deployed)
    }

    async fn run(&self, id: &UnitId, unit_path: &Path) -> Result<()> {
        for stage in [HookStage::Pre, HookStage::Post] {
            hooks::sync_stage(self.source.as_ref(), id, unit_path, stage).await?;
        }

        let secrets = secrets::aggregate(&self.secrets, id).await?;
        for conflict in &secrets.conflicts {
            warn!(
                unit = %id,
                key = %conflict.key,
                kept_from = %conflict.kept_from,
                discarded_from = %conflict.discarded_from,
                "Secret key provided more than once"
            );
            self.bus
                .publish(
                    Event::new(NOTIFY_SECRET_CONFLICT, EVENT_SOURCE)
                        .with_unit(id.clone())
                        .with_detail("key", conflict.key.as_str())
                        .with_detail("kept_from", conflict.kept_from.as_str())
                        .with_detail("discarded_from", conflict.discarded_from.as_str())
                        .with_message(format!(
                            "secret '{}' from '{}' overrides '{}'",
                            conflict.key, conflict.kept_from, conflict.discarded_from
                        )),
                )
                .await;
        }

        let ctx = HookContext::new(id.clone(), unit_path);
        let global = self.config.global_hooks_dir.as_deref();

        if let Some(root) = global {
            hooks::run_stage(&HookStage::Pre.global_dir(root), HookStage::Pre, &ctx).await?;
        }
        hooks::run_stage(&HookStage::Pre.unit_dir(unit_path), HookStage::Pre, &ctx).await?;

        info!(unit = %id, "Bringing unit up");
        self.executor.up(unit_path, &secrets.env).await?;

        if let Err(e) =
            hooks::run_stage(&HookStage::Post.unit_dir(unit_path), HookStage::Post, &ctx).await
        {
            warn!(unit = %id, error = %e, "Unit post-hook failed after a successful deploy");
        }
        if let Some(root) = global {
            hooks::run_stage(&HookStage::Post.global_dir(root), HookStage::Post, &ctx).await?;
        }
        Ok(())
    }
}

async fn local_matches(path: &Path, content: &[u8]) -> Result<bool> {
    match tokio::fs::read(path).await {
        Ok(existing) => Ok(existing == content),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path, &e)),
    }
}
