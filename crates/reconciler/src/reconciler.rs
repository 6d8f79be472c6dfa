//! Reconciliation cycle.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleetsync_core::{CoreConfig, UnitId};
use fleetsync_events::event::{
    DEPLOY_FAILED, DEPLOY_SKIPPED, DEPLOY_SUCCESS, NOTIFY_DIVERGENCE, NOTIFY_STATE_CONFLICT,
    PRUNE_FAILED, PRUNE_SUCCESS, RECONCILE_COMPLETED,
};
use fleetsync_events::{Event, EventBus};
use fleetsync_modules::Plugin;
use itertools::Itertools;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::executor::DeploymentExecutor;
use crate::pipeline::{DeployPipeline, PipelineConfig};
use crate::source::SourceProvider;
use crate::types::{
    CycleReport, DeployOutcome, DesiredSet, EVENT_SOURCE, RemovalSet, SearchQuery, UnitFailure,
    UnitState,
};

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Identities whose units are scanned.
    pub users: Vec<String>,
    pub topic: String,
    pub remove_topic: String,
    pub target_dir: PathBuf,
    pub global_hooks_dir: Option<PathBuf>,
    pub dry_run: bool,
}

impl ReconcilerConfig {
    pub fn from_core(core: &CoreConfig) -> Self {
        Self {
            users: core.users.clone(),
            topic: core.topic.clone(),
            remove_topic: core.remove_topic.clone(),
            target_dir: absolute_or_given(&core.target_dir),
            global_hooks_dir: core.global_hooks_dir.as_deref().map(absolute_or_given),
            dry_run: core.dry_run,
        }
    }

    fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            target_dir: self.target_dir.clone(),
            global_hooks_dir: self.global_hooks_dir.clone(),
            dry_run: self.dry_run,
        }
    }
}

/// Result of the discovery queries of one cycle.
#[derive(Debug, Default)]
pub struct DesiredState {
    pub desired: DesiredSet,
    pub removal: RemovalSet,
    pub failures: usize,
    /// Users whose desired-state query failed; their units cannot be judged.
    pub unknown_owners: BTreeSet<String>,
}

/// Converges the local unit tree onto the source's desired and removal sets.
pub struct Reconciler {
    source: Arc<dyn SourceProvider>,
    executor: Arc<dyn DeploymentExecutor>,
    pipeline: DeployPipeline,
    bus: Arc<EventBus>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn SourceProvider>,
        executor: Arc<dyn DeploymentExecutor>,
        secrets: Vec<Arc<dyn Plugin>>,
        bus: Arc<EventBus>,
        config: ReconcilerConfig,
    ) -> Self {
        let pipeline = DeployPipeline::new(
            Arc::clone(&source),
            Arc::clone(&executor),
            secrets,
            Arc::clone(&bus),
            config.pipeline(),
        );
        Self {
            source,
            executor,
            pipeline,
            bus,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &DeployPipeline {
        &self.pipeline
    }

    /// Run the desired, removal and archived queries for every user.
    ///
    /// A failed query is logged and counted; the others still contribute. A
    /// failed desired query also marks its user in `unknown_owners`.
    pub async fn desired_state(&self) -> DesiredState {
        let mut state = DesiredState::default();

        for user in &self.config.users {
            match self.source.search(&SearchQuery::desired(user, &self.config.topic)).await {
                Ok(units) => {
                    for unit in units {
                        state.desired.insert(unit.id.clone(), unit);
                    }
                }
                Err(e) => {
                    error!(user = %user, error = %e, "Desired-state search failed");
                    state.failures += 1;
                    state.unknown_owners.insert(user.clone());
                }
            }

            let removal_queries = [
                SearchQuery::removal(user, &self.config.remove_topic),
                SearchQuery::archived(user, &self.config.topic),
            ];
            for query in removal_queries {
                match self.source.search(&query).await {
                    Ok(units) => state.removal.extend(units.into_iter().map(|u| u.id)),
                    Err(e) => {
                        error!(query = %query, error = %e, "Removal search failed");
                        state.failures += 1;
                    }
                }
            }
        }

        info!(
            desired = state.desired.len(),
            removal = state.removal.len(),
            "Desired state calculated"
        );
        state
    }

    /// Units present under the target directory, as `<owner>/<name>` leaves.
    ///
    /// # Errors
    ///
    /// Fails if the target directory exists but cannot be read.
    pub async fn local_inventory(&self) -> Result<BTreeSet<UnitId>> {
        let mut units = BTreeSet::new();
        for owner in subdirectories(&self.config.target_dir).await? {
            let owner_path = self.config.target_dir.join(&owner);
            for name in subdirectories(&owner_path).await? {
                units.insert(UnitId::new(owner.clone(), name));
            }
        }
        Ok(units)
    }

    /// Run one full cycle: classify, prune, warn, deploy, report.
    pub async fn run_cycle(&self) -> CycleReport {
        info!(dry_run = self.config.dry_run, "Starting reconciliation");

        let DesiredState {
            desired,
            removal,
            failures,
            unknown_owners,
        } = self.desired_state().await;

        let mut report = CycleReport {
            dry_run: self.config.dry_run,
            desired: desired.len(),
            removal: removal.len(),
            query_failures: failures,
            ..CycleReport::default()
        };

        let local = match self.local_inventory().await {
            Ok(local) => local,
            Err(e) => {
                error!(error = %e, "Local inventory failed");
                BTreeSet::new()
            }
        };

        for id in &local {
            match UnitState::classify(id, &desired, &removal) {
                UnitState::Prune if unknown_owners.contains(id.owner()) => {
                    warn!(unit = %id, "Desired state of owner is unknown this cycle; not pruning");
                    report.held.push(id.clone());
                }
                UnitState::Prune => self.prune(id, &mut report).await,
                UnitState::Untracked => {
                    warn!(unit = %id, "Local unit is neither desired nor marked for removal; leaving it in place");
                    self.publish(
                        Event::new(NOTIFY_DIVERGENCE, EVENT_SOURCE)
                            .with_unit(id.clone())
                            .with_message(format!(
                                "{id} exists locally but is not tracked; it will not be removed"
                            )),
                    )
                    .await;
                    report.divergent.push(id.clone());
                }
                UnitState::Deploy | UnitState::Conflict => {}
            }
        }

        for id in desired.keys().filter(|id| removal.contains(*id)) {
            warn!(unit = %id, "Unit is both desired and marked for removal; skipping");
            self.publish(
                Event::new(NOTIFY_STATE_CONFLICT, EVENT_SOURCE)
                    .with_unit(id.clone())
                    .with_message(format!(
                        "{id} carries both '{}' and '{}'; resolve manually",
                        self.config.topic, self.config.remove_topic
                    )),
            )
            .await;
            report.conflicts.push(id.clone());
        }

        for unit in desired.values().filter(|u| !removal.contains(&u.id)) {
            let id = &unit.id;
            match self.pipeline.deploy(unit).await {
                Ok(DeployOutcome::Deployed | DeployOutcome::WouldDeploy) => {
                    if !self.config.dry_run {
                        self.publish(Event::new(DEPLOY_SUCCESS, EVENT_SOURCE).with_unit(id.clone()))
                            .await;
                    }
                    report.deployed.push(id.clone());
                }
                Ok(DeployOutcome::Unchanged) => report.unchanged.push(id.clone()),
                Ok(DeployOutcome::NoDescriptor) => {
                    self.publish(
                        Event::new(DEPLOY_SKIPPED, EVENT_SOURCE)
                            .with_unit(id.clone())
                            .with_message("no descriptor"),
                    )
                    .await;
                    report.skipped.push(id.clone());
                }
                Err(e) => {
                    error!(unit = %id, error = %e, "Deploy failed");
                    self.publish(
                        Event::new(DEPLOY_FAILED, EVENT_SOURCE)
                            .with_unit(id.clone())
                            .with_detail("error", e.to_string())
                            .with_message(e.to_string()),
                    )
                    .await;
                    report.failed.push(UnitFailure {
                        unit: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.converged() {
            info!("System converged");
        } else {
            info!(
                deployed = %report.deployed.iter().join(", "),
                pruned = %report.pruned.iter().join(", "),
                failed = report.failed.len() + report.prune_failed.len(),
                "Reconciliation complete"
            );
        }

        let summary = serde_json::to_value(&report).unwrap_or(Value::Null);
        let mut completed = Event::new(RECONCILE_COMPLETED, EVENT_SOURCE);
        if let Value::Object(details) = summary {
            completed.details = details;
        }
        self.publish(completed).await;

        report
    }

    async fn prune(&self, id: &UnitId, report: &mut CycleReport) {
        let unit_path = self.pipeline.config().unit_path(id);
        info!(unit = %id, "Pruning unit marked for removal");

        if self.config.dry_run {
            info!(unit = %id, path = %unit_path.display(), "Dry run: would prune");
            report.pruned.push(id.clone());
            return;
        }

        match self.teardown(&unit_path).await {
            Ok(()) => {
                self.pipeline.forget(id);
                self.publish(Event::new(PRUNE_SUCCESS, EVENT_SOURCE).with_unit(id.clone()))
                    .await;
                report.pruned.push(id.clone());
            }
            Err(e) => {
                error!(unit = %id, error = %e, "Prune failed");
                self.publish(
                    Event::new(PRUNE_FAILED, EVENT_SOURCE)
                        .with_unit(id.clone())
                        .with_detail("error", e.to_string())
                        .with_message(e.to_string()),
                )
                .await;
                report.prune_failed.push(UnitFailure {
                    unit: id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn teardown(&self, unit_path: &Path) -> Result<()> {
        if let Err(e) = self.executor.down(unit_path).await {
            // Services may already be gone; the directory is removed regardless.
            warn!(path = %unit_path.display(), error = %e, "Executor down failed");
        }

        tokio::fs::remove_dir_all(unit_path)
            .await
            .map_err(|e| Error::io(unit_path, &e))?;

        if let Some(owner_dir) = unit_path.parent() {
            // Only succeeds when no sibling units remain.
            if tokio::fs::remove_dir(owner_dir).await.is_ok() {
                debug!(path = %owner_dir.display(), "Removed empty owner directory");
            }
        }
        Ok(())
    }

    async fn publish(&self, event: Event) {
        self.bus.publish(event).await;
    }
}

/// `path` anchored at the working directory at startup; hooks run elsewhere.
fn absolute_or_given(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Names of the visible subdirectories of `dir`, sorted. A missing `dir` has none.
async fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(dir, &e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(dir, &e))? {
        let is_dir = entry
            .file_type()
            .await
            .map_err(|e| Error::io(entry.path(), &e))?
            .is_dir();
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_dir && !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
