//! Startup sequence and run loop.
//!
//! 1. Resolve configuration (YAML file over environment, CLI overrides last)
//! 2. Register the reconciler, then discovered extensions
//! 3. Initialize modules in registration order
//! 4. Start modules and the HTTP server, wait for a shutdown signal
//! 5. Stop modules in reverse order within the shutdown timeout

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetsync_core::{ConfigMap, CoreConfig};
use fleetsync_modules::{Module, ModuleManager, Registered};
use fleetsync_plugins::builtin_catalog;
use fleetsync_reconciler::{CycleReport, ReconcilerModule};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::Cli;

/// Merge the config file over `env`, apply CLI overrides and validate the core section.
///
/// # Errors
///
/// Fails when the file cannot be parsed or required core settings are missing.
pub fn resolve_config(cli: &Cli, env: ConfigMap) -> Result<(ConfigMap, CoreConfig)> {
    let file = match &cli.config {
        Some(path) => ConfigMap::load_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => ConfigMap::new(),
    };

    let mut config = ConfigMap::merge(&file, &env);
    if cli.dry_run {
        config.set("core", "dry_run", json!(true));
    }

    let core = CoreConfig::from_map(&config).context("Invalid core configuration")?;
    Ok((config, core))
}

/// The module manager with the reconciler registered first.
pub struct Daemon {
    manager: ModuleManager,
    reconciler: Arc<ReconcilerModule>,
    core: CoreConfig,
}

impl Daemon {
    /// # Errors
    ///
    /// Fails if the module manager cannot be created.
    pub fn build(config: ConfigMap, core: CoreConfig) -> Result<Self> {
        Self::with_reconciler(config, core, ReconcilerModule::new())
    }

    /// Build around a preconfigured reconciler module.
    ///
    /// # Errors
    ///
    /// Fails if the module manager cannot be created.
    pub fn with_reconciler(
        config: ConfigMap,
        core: CoreConfig,
        reconciler: ReconcilerModule,
    ) -> Result<Self> {
        let mut manager = ModuleManager::new(config).context("Failed to create module manager")?;
        let reconciler = Arc::new(reconciler);
        manager.register(Registered::Module(
            Arc::clone(&reconciler) as Arc<dyn Module>
        ))?;

        match &core.plugins_dir {
            Some(dir) => {
                let added = manager.load_extensions(dir, &builtin_catalog());
                info!(dir = %dir.display(), extensions = added, "Loaded extensions");
            }
            None => info!("No plugins directory configured"),
        }

        Ok(Self {
            manager,
            reconciler,
            core,
        })
    }

    pub fn manager(&self) -> &ModuleManager {
        &self.manager
    }

    /// # Errors
    ///
    /// Returns the first module initialization failure.
    pub async fn init(&self) -> Result<()> {
        self.manager
            .init()
            .await
            .context("Module initialization failed")
    }

    /// One reconciliation cycle without the tick loop.
    ///
    /// # Errors
    ///
    /// Fails if modules were not initialized.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let report = self.reconciler.run_once().await?;
        Ok(report)
    }

    /// Start every module and serve HTTP until `shutdown` resolves.
    ///
    /// An HTTP server failure is logged and triggers shutdown.
    ///
    /// # Errors
    ///
    /// Returns the HTTP server error, after shutdown was signalled.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.manager.start();

        let stop = CancellationToken::new();
        let server = async {
            let Some(addr) = self.core.http_addr else {
                return Ok(());
            };
            let served = self.manager.serve_http(addr, stop.clone()).await;
            if let Err(e) = &served {
                error!(%addr, error = %e, "HTTP server failed");
                stop.cancel();
            }
            served
        };
        let signal = async {
            tokio::select! {
                () = shutdown => {}
                () = stop.cancelled() => {}
            }
            stop.cancel();
        };

        info!("fleetsync is running. Press Ctrl+C to stop.");
        let (served, ()) = tokio::join!(server, signal);
        served.context("HTTP server failed")
    }

    /// Stop modules in reverse order, waiting at most `timeout`.
    pub async fn stop(&self, timeout: Duration) {
        let deadline = CancellationToken::new();
        let timer = {
            let deadline = deadline.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(timeout = %humantime::format_duration(timeout), "Shutdown timeout elapsed");
                deadline.cancel();
            })
        };

        self.manager.stop(deadline).await;
        timer.abort();
        info!("fleetsync stopped");
    }
}
