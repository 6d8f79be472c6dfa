//! Plugin introspection routes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::module::{Capability, Plugin, Registered, ServiceStatus};

pub const PLUGINS_PATH: &str = "/plugins";
pub const PLUGIN_PATH: &str = "/plugins/{name}";

/// Public view of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub capabilities: Vec<Capability>,
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl PluginInfo {
    pub fn from_plugin(plugin: &dyn Plugin, include_config: bool) -> Self {
        Self {
            name: plugin.name().to_string(),
            description: plugin.description().to_string(),
            capabilities: plugin.capabilities().to_vec(),
            status: plugin.status(),
            config: if include_config { plugin.config_view() } else { None },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    include_config: bool,
}

type Modules = Arc<[Registered]>;

/// Router serving `GET /plugins` and `GET /plugins/{name}`.
pub fn router(modules: Modules) -> Router {
    Router::new()
        .route(PLUGINS_PATH, get(list_plugins))
        .route(PLUGIN_PATH, get(get_plugin))
        .with_state(modules)
}

async fn list_plugins(
    State(modules): State<Modules>,
    Query(params): Query<ListParams>,
) -> Json<Vec<PluginInfo>> {
    Json(
        modules
            .iter()
            .filter_map(Registered::as_plugin)
            .map(|p| PluginInfo::from_plugin(p.as_ref(), params.include_config))
            .collect(),
    )
}

async fn get_plugin(State(modules): State<Modules>, Path(name): Path<String>) -> Response {
    match modules
        .iter()
        .filter_map(Registered::as_plugin)
        .find(|p| p.name() == name)
    {
        Some(plugin) => Json(PluginInfo::from_plugin(plugin.as_ref(), true)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, &format!("plugin '{name}' not found")),
    }
}

/// JSON error body, `{"error": message}`.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use fleetsync_core::Secret;
    use http_body_util::BodyExt;
    use serde_json::Map;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::error::{Error, Result};
    use crate::module::Module;
    use crate::registry::Registry;

    struct Vault {
        token: Secret,
    }

    #[async_trait]
    impl Module for Vault {
        fn name(&self) -> &str {
            "vault"
        }
        async fn init(&self, _registry: &Registry) -> Result<()> {
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
    impl Plugin for Vault {
        fn description(&self) -> &str {
            "secret store"
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::Secrets]
        }
        fn status(&self) -> ServiceStatus {
            ServiceStatus::Healthy
        }
        async fn execute(&self, action: &str, _params: &Map<String, Value>) -> Result<Value> {
            Err(Error::unsupported_action("vault", action))
        }
        fn config_view(&self) -> Option<Value> {
            Some(json!({ "address": "http://vault:8200", "token": self.token }))
        }
    }

    fn app() -> Router {
        router(
            vec![Registered::plugin(Vault {
                token: Secret::new("s.abcdef"),
            })]
            .into(),
        )
    }

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn should_list_plugins_without_config_by_default() {
        let (status, body) = get_json("/plugins").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "vault");
        assert_eq!(body[0]["capabilities"], json!(["secrets"]));
        assert_eq!(body[0]["status"], "healthy");
        assert!(body[0].get("config").is_none(), "config is opt-in for listing");
    }

    #[tokio::test]
    async fn should_include_redacted_config_on_request() {
        let (status, body) = get_json("/plugins?include_config=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["config"]["token"], "REDACTED");
        assert!(!body.to_string().contains("s.abcdef"), "secret must never be serialized");
    }

    #[tokio::test]
    async fn should_show_single_plugin_with_config() {
        let (status, body) = get_json("/plugins/vault").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["description"], "secret store");
        assert_eq!(body["config"]["address"], "http://vault:8200");
    }

    #[tokio::test]
    async fn should_return_json_404_for_unknown_plugin() {
        let (status, body) = get_json("/plugins/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "plugin 'nope' not found");
    }
}
