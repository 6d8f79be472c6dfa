//! Handle given to modules at `init`.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use axum::routing::MethodRouter;
use fleetsync_core::ConfigMap;
use fleetsync_events::{Event, EventBus, EventPattern, EventTypeDesc, Listener};
use tracing::debug;

use crate::error::{Error, Result};
use crate::module::{Capability, Plugin, Registered};

/// Shared, append-only table of HTTP routes contributed by modules.
#[derive(Clone, Default)]
pub struct RouteTable {
    inner: Arc<Mutex<Routes>>,
}

#[derive(Default)]
struct Routes {
    router: Router,
    paths: BTreeSet<String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table where `paths` are already taken.
    pub fn with_reserved<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        let table = Self::new();
        {
            let mut routes = table.lock();
            routes.paths.extend(paths.into_iter().map(str::to_string));
        }
        table
    }

    /// Register a route.
    ///
    /// # Errors
    ///
    /// Rejects paths that do not start with `/` and paths already registered.
    pub fn add(&self, path: &str, route: MethodRouter) -> Result<()> {
        if !path.starts_with('/') {
            return Err(Error::route(path, "path must start with '/'"));
        }

        let mut routes = self.lock();
        if !routes.paths.insert(path.to_string()) {
            return Err(Error::route(path, "already registered"));
        }
        let router = std::mem::take(&mut routes.router);
        routes.router = router.route(path, route);
        debug!(path, "Registered HTTP route");
        Ok(())
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().paths.iter().cloned().collect()
    }

    /// Current routes as a router.
    pub fn router(&self) -> Router {
        self.lock().router.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry handed to every module's `init`.
///
/// Cloning is cheap. `config()` returns a private deep copy, so no module can
/// change what another module sees.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    modules: Arc<[Registered]>,
    config: ConfigMap,
    http: reqwest::Client,
    routes: RouteTable,
    bus: Arc<EventBus>,
}

impl Registry {
    pub(crate) fn new(
        modules: Arc<[Registered]>,
        config: ConfigMap,
        http: reqwest::Client,
        routes: RouteTable,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                modules,
                config,
                http,
                routes,
                bus,
            }),
        }
    }

    pub fn config(&self) -> ConfigMap {
        self.inner.config.clone()
    }

    /// Shared outbound HTTP client.
    pub fn http_client(&self) -> reqwest::Client {
        self.inner.http.clone()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.bus)
    }

    pub async fn subscribe(&self, pattern: impl Into<EventPattern>, listener: Listener) {
        self.inner.bus.subscribe(pattern, listener).await;
    }

    pub async fn publish(&self, event: Event) -> usize {
        self.inner.bus.publish(event).await
    }

    /// # Errors
    ///
    /// Fails when the event type is already registered.
    pub async fn register_event_type(&self, desc: EventTypeDesc) -> Result<()> {
        Ok(self.inner.bus.register_event_type(desc).await?)
    }

    /// Every registered module, in registration order.
    pub fn modules(&self) -> &[Registered] {
        &self.inner.modules
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.inner
            .modules
            .iter()
            .filter_map(Registered::as_plugin)
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Plugins declaring `capability`, in registration order.
    pub fn plugins_with_capability(&self, capability: Capability) -> Vec<Arc<dyn Plugin>> {
        self.inner
            .modules
            .iter()
            .filter_map(Registered::as_plugin)
            .filter(|p| p.has_capability(capability))
            .cloned()
            .collect()
    }
}
