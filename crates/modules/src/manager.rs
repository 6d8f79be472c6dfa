//! Module lifecycle manager.
//!
//! Owns the registered modules, the event bus, the shared HTTP client and the
//! route table. Runs `init` sequentially, `start` concurrently and `stop` in
//! reverse registration order.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use fleetsync_core::ConfigMap;
use fleetsync_events::EventBus;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, error, info, info_span, warn};

use crate::api;
use crate::discovery::{ExtensionCatalog, discover};
use crate::error::{Error, Result};
use crate::module::Registered;
use crate::registry::{Registry, RouteTable};

/// Timeout of the shared outbound HTTP client.
pub const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ModuleManager {
    modules: Vec<Registered>,
    config: ConfigMap,
    bus: Arc<EventBus>,
    http: reqwest::Client,
    routes: RouteTable,
    running: CancellationToken,
    tasks: TaskTracker,
}

impl ModuleManager {
    /// # Errors
    ///
    /// Fails if the shared HTTP client cannot be built.
    pub fn new(config: ConfigMap) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .build()
            .map_err(|e| Error::HttpClient {
                reason: e.to_string(),
            })?;

        Ok(Self {
            modules: Vec::new(),
            config,
            bus: Arc::new(EventBus::new()),
            http,
            routes: RouteTable::with_reserved([api::PLUGINS_PATH, api::PLUGIN_PATH]),
            running: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Register a module. Registration order is lifecycle order.
    ///
    /// # Errors
    ///
    /// Rejects a second module with the same name.
    pub fn register(&mut self, module: Registered) -> Result<()> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(Error::DuplicateName {
                name: module.name().to_string(),
            });
        }
        info!(module = module.name(), "Registered module");
        self.modules.push(module);
        Ok(())
    }

    /// Discover and register extensions from `dir`. Returns how many were added.
    ///
    /// Load failures and duplicate names are logged and skipped.
    pub fn load_extensions(&mut self, dir: &Path, catalog: &ExtensionCatalog) -> usize {
        let mut added = 0;
        for (path, module) in discover(dir, catalog).loaded {
            match self.register(module) {
                Ok(()) => added += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping extension"),
            }
        }
        added
    }

    pub fn modules(&self) -> &[Registered] {
        &self.modules
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Registry over the modules registered so far.
    pub fn registry(&self) -> Registry {
        Registry::new(
            self.modules.clone().into(),
            self.config.clone(),
            self.http.clone(),
            self.routes.clone(),
            Arc::clone(&self.bus),
        )
    }

    /// Initialize every module in registration order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failure.
    pub async fn init(&self) -> Result<()> {
        let registry = self.registry();
        for module in &self.modules {
            let name = module.name().to_string();
            module
                .init(&registry)
                .instrument(info_span!("module", module = %name))
                .await
                .map_err(|e| match e {
                    Error::Init { .. } => e,
                    other => Error::init(&name, other),
                })?;
            info!(module = %name, "Initialized module");
        }
        Ok(())
    }

    /// Start every module in its own task. A failing start is logged.
    pub fn start(&self) {
        for module in &self.modules {
            let module = module.clone();
            let cancel = self.running.child_token();
            let span = info_span!("module", module = %module.name());
            self.tasks.spawn(
                async move {
                    match module.start(cancel).await {
                        Ok(()) => {}
                        Err(e) => error!(error = %e, "Module start failed"),
                    }
                }
                .instrument(span),
            );
        }
        info!(modules = self.modules.len(), "Started modules");
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.running.clone()
    }

    /// Stop every module in reverse registration order.
    ///
    /// Signals running `start` tasks, calls each `stop` (errors are logged),
    /// then waits for the tasks until `deadline` fires.
    pub async fn stop(&self, deadline: CancellationToken) {
        self.running.cancel();

        for module in self.modules.iter().rev() {
            let name = module.name().to_string();
            match module
                .stop(deadline.clone())
                .instrument(info_span!("module", module = %name))
                .await
            {
                Ok(()) => info!(module = %name, "Stopped module"),
                Err(e) => error!(module = %name, error = %e, "Module stop failed"),
            }
        }

        self.tasks.close();
        tokio::select! {
            () = self.tasks.wait() => {}
            () = deadline.cancelled() => {
                warn!(pending = self.tasks.len(), "Shutdown deadline reached with module tasks still running");
            }
        }
        self.bus.drain_until(&deadline).await;
    }

    /// Introspection routes merged with every module route.
    pub fn router(&self) -> Router {
        api::router(self.modules.clone().into())
            .merge(self.routes.router())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve [`Self::router`] on `addr` until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound or the server errors.
    pub async fn serve_http(&self, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        info!("HTTP server stopped");
        Ok(())
    }
}
