//! The reconciler as a registered module.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleetsync_core::CoreConfig;
use fleetsync_events::event::{
    DEPLOY_FAILED, DEPLOY_SKIPPED, DEPLOY_SUCCESS, NOTIFY_DIVERGENCE, NOTIFY_SECRET_CONFLICT,
    NOTIFY_STATE_CONFLICT, PRUNE_FAILED, PRUNE_SUCCESS, RECONCILE_COMPLETED, RECONCILE_NOW,
};
use fleetsync_events::{EventTypeDesc, PayloadField, listener};
use fleetsync_modules::{Capability, Error, Module, Registry, Result};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::executor::{ComposeExecutor, DeploymentExecutor};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::source::{GitHubSource, SourceProvider};
use crate::types::{CycleReport, EVENT_SOURCE};

struct Running {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    trigger: Mutex<Option<mpsc::Receiver<()>>>,
}

/// Runs a reconciliation cycle on start, every interval, and on `reconcile_now`.
pub struct ReconcilerModule {
    source: Option<Arc<dyn SourceProvider>>,
    executor: Option<Arc<dyn DeploymentExecutor>>,
    running: OnceLock<Running>,
    stopping: CancellationToken,
    cycles: TaskTracker,
}

impl Default for ReconcilerModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcilerModule {
    pub fn new() -> Self {
        Self {
            source: None,
            executor: None,
            running: OnceLock::new(),
            stopping: CancellationToken::new(),
            cycles: TaskTracker::new(),
        }
    }

    /// Replace the GitHub source built during `init`.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SourceProvider>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the compose executor built during `init`.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn DeploymentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// The reconciler built during `init`.
    pub fn reconciler(&self) -> Option<Arc<Reconciler>> {
        self.running.get().map(|r| Arc::clone(&r.reconciler))
    }

    fn state(&self) -> Result<&Running> {
        self.running
            .get()
            .ok_or_else(|| Error::start(EVENT_SOURCE, "module was not initialized"))
    }

    /// Run a single cycle outside the tick loop.
    ///
    /// # Errors
    ///
    /// Fails if `init` has not run.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let state = self.state()?;
        Ok(self.cycle(state).await)
    }

    async fn cycle(&self, state: &Running) -> CycleReport {
        let _in_flight = self.cycles.token();
        state.reconciler.run_cycle().await
    }
}

/// Event types published by the reconciler. Unit events carry the unit in
/// `Event::unit`; payload fields describe `details` only.
pub fn event_types() -> Vec<EventTypeDesc> {
    let error = || PayloadField::required("string", "failure reason");
    let plugin = |description: &str| PayloadField::required("string", description);
    vec![
        EventTypeDesc::new(DEPLOY_SUCCESS, "A unit was deployed"),
        EventTypeDesc::new(DEPLOY_FAILED, "A unit deploy was aborted").with_field("error", error()),
        EventTypeDesc::new(DEPLOY_SKIPPED, "A desired unit has no descriptor"),
        EventTypeDesc::new(PRUNE_SUCCESS, "A unit marked for removal was torn down"),
        EventTypeDesc::new(PRUNE_FAILED, "Tearing down a unit failed").with_field("error", error()),
        EventTypeDesc::new(RECONCILE_COMPLETED, "A reconciliation cycle finished")
            .with_field("desired", PayloadField::required("number", "desired units"))
            .with_field("removal", PayloadField::required("number", "units marked for removal")),
        EventTypeDesc::new(NOTIFY_SECRET_CONFLICT, "Two secret providers returned the same key")
            .with_field("key", PayloadField::required("string", "conflicting key"))
            .with_field("kept_from", plugin("plugin whose value is used"))
            .with_field("discarded_from", plugin("plugin whose value is ignored")),
        EventTypeDesc::new(NOTIFY_STATE_CONFLICT, "A unit is both desired and marked for removal"),
        EventTypeDesc::new(
            NOTIFY_DIVERGENCE,
            "A local unit is neither desired nor marked for removal",
        ),
        EventTypeDesc::new(RECONCILE_NOW, "Request an immediate reconciliation cycle"),
    ]
}

#[async_trait]
impl Module for ReconcilerModule {
    fn name(&self) -> &str {
        EVENT_SOURCE
    }

    async fn init(&self, registry: &Registry) -> Result<()> {
        let core = CoreConfig::from_map(&registry.config())?;

        let source = match &self.source {
            Some(source) => Arc::clone(source),
            None => Arc::new(
                GitHubSource::new(registry.http_client(), &core.api_url, core.token.clone())
                    .map_err(|e| Error::init(EVENT_SOURCE, e))?,
            ),
        };
        let executor = self
            .executor
            .clone()
            .unwrap_or_else(|| Arc::new(ComposeExecutor::new()));
        let secrets = registry.plugins_with_capability(Capability::Secrets);
        if !secrets.is_empty() {
            let names: Vec<&str> = secrets.iter().map(|p| p.name()).collect();
            info!(providers = ?names, "Secret providers in precedence order");
        }

        for desc in event_types() {
            let name = desc.name.clone();
            if let Err(e) = registry.register_event_type(desc).await {
                debug!(event_type = %name, error = %e, "Event type already registered");
            }
        }

        let (tx, rx) = mpsc::channel(1);
        registry
            .subscribe(
                RECONCILE_NOW,
                listener(move |event| {
                    let tx = tx.clone();
                    async move {
                        if tx.try_send(()).is_err() {
                            debug!(source = %event.source, "Reconcile already pending, trigger dropped");
                        }
                    }
                }),
            )
            .await;

        let reconciler = Reconciler::new(
            source,
            executor,
            secrets,
            registry.bus(),
            ReconcilerConfig::from_core(&core),
        );
        self.running
            .set(Running {
                reconciler: Arc::new(reconciler),
                interval: core.interval,
                trigger: Mutex::new(Some(rx)),
            })
            .map_err(|_| Error::init(EVENT_SOURCE, "module initialized twice"))?;

        info!(
            users = ?core.users,
            topic = %core.topic,
            interval = ?core.interval,
            dry_run = core.dry_run,
            "Reconciler configured"
        );
        Ok(())
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let state = self.state()?;
        let mut trigger = state
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::start(EVENT_SOURCE, "already started"))?;

        info!("Starting reconciler");
        self.cycle(state).await;

        let period = state.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.stopping.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = trigger.recv() => {
                    info!("Reconciliation triggered");
                    ticker.reset();
                }
            }
            self.cycle(state).await;
        }

        debug!("Reconciler loop exited");
        Ok(())
    }

    async fn stop(&self, deadline: CancellationToken) -> Result<()> {
        self.stopping.cancel();
        self.cycles.close();

        info!("Waiting for reconciliation to finish");
        tokio::select! {
            () = self.cycles.wait() => info!("Reconciler stopped gracefully"),
            () = deadline.cancelled() => {
                warn!(in_flight = self.cycles.len(), "Deadline reached while a reconciliation cycle was running");
            }
        }
        Ok(())
    }
}
