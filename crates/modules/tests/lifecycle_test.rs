//! Manager behavior across discovery, init and capability lookup.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use fleetsync_core::ConfigMap;
use fleetsync_events::{Event, listener};
use fleetsync_modules::{
    Capability, Error, ExtensionCatalog, ExtensionManifest, Module, ModuleManager, Plugin,
    Registered, Registry, Result, ServiceStatus,
};
use http_body_util::BodyExt;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Secret provider answering with a fixed map.
struct FixedSecrets {
    name: String,
    route: bool,
}

#[async_trait]
impl Module for FixedSecrets {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, registry: &Registry) -> Result<()> {
        if self.route {
            let body = format!("hello from {}", self.name);
            registry
                .routes()
                .add("/hello", get(move || async move { body }))?;
        }
        Ok(())
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _deadline: CancellationToken) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Plugin for FixedSecrets {
    fn description(&self) -> &str {
        "fixed secrets"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Secrets]
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus::Healthy
    }

    async fn execute(&self, action: &str, _params: &Map<String, Value>) -> Result<Value> {
        match action {
            "get_secrets" => Ok(json!({ "SOURCE": self.name })),
            other => Err(Error::unsupported_action(&self.name, other)),
        }
    }
}

fn catalog() -> ExtensionCatalog {
    ExtensionCatalog::new().with("fixed", |m: &ExtensionManifest| {
        Ok(Registered::plugin(FixedSecrets {
            name: m.name_or("fixed").to_string(),
            route: m.name.as_deref() == Some("router"),
        }))
    })
}

fn write(dir: &Path, file: &str, body: &str) -> std::io::Result<()> {
    std::fs::write(dir.join(file), body)
}

#[tokio::test]
async fn test_discovery_order_is_capability_precedence() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    write(dir.path(), "20-zeta.yaml", "kind: fixed\nname: zeta\n")?;
    write(dir.path(), "10-omega.yaml", "kind: fixed\nname: omega\n")?;
    write(dir.path(), "15-dup.yaml", "kind: fixed\nname: omega\n")?;

    let mut manager = ModuleManager::new(ConfigMap::new())?;
    let added = manager.load_extensions(dir.path(), &catalog());
    assert_eq!(added, 2, "duplicate instance name is skipped");

    manager.init().await?;
    let names: Vec<String> = manager
        .registry()
        .plugins_with_capability(Capability::Secrets)
        .iter()
        .map(|p| p.name().to_string())
        .collect();
    assert_eq!(names, vec!["omega", "zeta"]);
    Ok(())
}

#[tokio::test]
async fn test_extension_routes_are_served_next_to_introspection() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let mut manager = ModuleManager::new(ConfigMap::new())?;
    manager.register(Registered::plugin(FixedSecrets {
        name: "router".into(),
        route: true,
    }))?;
    manager.init().await?;

    let app = manager.router();
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/hello").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await?.to_bytes();
    assert_eq!(&body[..], b"hello from router");

    let response = app
        .oneshot(Request::builder().uri("/plugins").body(Body::empty())?)
        .await?;
    let body = response.into_body().collect().await?.to_bytes();
    let plugins: Value = serde_json::from_slice(&body)?;
    assert_eq!(plugins[0]["name"], "router");
    Ok(())
}

#[tokio::test]
async fn test_extension_cannot_shadow_introspection_route() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let manager = ModuleManager::new(ConfigMap::new())?;
    let result = manager.routes().add("/plugins", get(|| async { "mine" }));
    assert!(matches!(result, Err(Error::Route { .. })));
    Ok(())
}

#[tokio::test]
async fn test_modules_share_one_event_bus() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let manager = ModuleManager::new(ConfigMap::new())?;
    let first = manager.registry();
    let second = manager.registry();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    first
        .subscribe(
            "deploy_*",
            listener(move |event: Event| {
                let sink = Arc::clone(&sink);
                async move {
                    if let Ok(mut guard) = sink.lock() {
                        guard.push(event.source);
                    }
                }
            }),
        )
        .await;

    second.publish(Event::new("deploy_success", "second")).await;
    manager.bus().drain().await;

    let seen = seen.lock().map(|g| g.clone()).unwrap_or_default();
    assert_eq!(seen, vec!["second".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_execute_reaches_plugin_through_registry() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let mut manager = ModuleManager::new(ConfigMap::new())?;
    manager.register(Registered::plugin(FixedSecrets {
        name: "env".into(),
        route: false,
    }))?;

    let plugin = manager.registry().plugin("env").ok_or("plugin missing")?;
    let secrets = plugin.execute("get_secrets", &Map::new()).await?;
    assert_eq!(secrets, json!({ "SOURCE": "env" }));

    let unsupported = plugin.execute("rotate", &Map::new()).await;
    assert!(matches!(unsupported, Err(Error::UnsupportedAction { .. })));
    Ok(())
}
