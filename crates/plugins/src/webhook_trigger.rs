//! `POST /reconcile` endpoint that asks the reconciler for an immediate cycle.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use fleetsync_core::Secret;
use fleetsync_core::config::decode_section;
use fleetsync_events::event::{RECONCILE_NOW, WEBHOOK_RECEIVED};
use fleetsync_events::{Event, EventBus, EventTypeDesc, PayloadField};
use fleetsync_modules::api::error_response;
use fleetsync_modules::{Capability, Error, Module, Plugin, Registry, Result, ServiceStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const KIND: &str = "webhook_trigger";
pub const DEFAULT_NAME: &str = "webhook_trigger";
pub const RECONCILE_PATH: &str = "/reconcile";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookTriggerConfig {
    #[serde(default)]
    pub token: Secret,
}

#[derive(Clone)]
struct TriggerState {
    name: Arc<str>,
    token: Secret,
    bus: Arc<EventBus>,
}

pub struct WebhookTrigger {
    name: String,
    config: OnceLock<WebhookTriggerConfig>,
}

impl WebhookTrigger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: OnceLock::new(),
        }
    }
}

impl Default for WebhookTrigger {
    fn default() -> Self {
        Self::new(DEFAULT_NAME)
    }
}

fn received_event_type() -> EventTypeDesc {
    EventTypeDesc::new(WEBHOOK_RECEIVED, "An authorized reconcile webhook arrived")
        .with_field("user_agent", PayloadField::optional("string", "Caller user agent"))
        .with_field("delivery", PayloadField::optional("string", "Caller delivery id"))
}

#[async_trait]
impl Module for WebhookTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, registry: &Registry) -> Result<()> {
        if self.config.get().is_some() {
            return Err(Error::init(&self.name, "module initialized twice"));
        }
        let config: WebhookTriggerConfig = decode_section(&registry.config(), &self.name)?;
        if config.token.is_empty() {
            warn!(plugin = %self.name, path = RECONCILE_PATH, "Webhook trigger has no token, endpoint is unsecured");
        }

        if let Err(e) = registry.register_event_type(received_event_type()).await {
            debug!(error = %e, "Event type already registered");
        }

        let state = TriggerState {
            name: Arc::from(self.name.as_str()),
            token: config.token.clone(),
            bus: registry.bus(),
        };
        registry
            .routes()
            .add(RECONCILE_PATH, post(reconcile).with_state(state))?;
        info!(plugin = %self.name, path = RECONCILE_PATH, "Webhook trigger registered");

        self.config
            .set(config)
            .map_err(|_| Error::init(&self.name, "module initialized twice"))
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _deadline: CancellationToken) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Plugin for WebhookTrigger {
    fn description(&self) -> &str {
        "Triggers a reconciliation cycle on POST /reconcile"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Trigger]
    }

    fn status(&self) -> ServiceStatus {
        match self.config.get() {
            None => ServiceStatus::Unknown,
            Some(c) if c.token.is_empty() => ServiceStatus::Unhealthy,
            Some(_) => ServiceStatus::Healthy,
        }
    }

    async fn execute(&self, action: &str, _params: &Map<String, Value>) -> Result<Value> {
        Err(Error::unsupported_action(&self.name, action))
    }

    fn config_view(&self) -> Option<Value> {
        let config = self.config.get()?;
        Some(json!({ "token": config.token, "path": RECONCILE_PATH }))
    }
}

fn authorized(headers: &HeaderMap, token: &Secret) -> bool {
    if token.is_empty() {
        return true;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented.trim() == token.expose())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn reconcile(State(state): State<TriggerState>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &state.token) {
        warn!(plugin = %state.name, "Rejected webhook with invalid token");
        return error_response(StatusCode::UNAUTHORIZED, "invalid or missing bearer token");
    }

    let mut received = Event::new(WEBHOOK_RECEIVED, state.name.as_ref())
        .with_message("reconcile requested over webhook");
    if let Some(agent) = header_str(&headers, header::USER_AGENT.as_str()) {
        received = received.with_detail("user_agent", agent);
    }
    if let Some(delivery) = header_str(&headers, "x-github-delivery") {
        received = received.with_detail("delivery", delivery);
    }
    state.bus.publish(received).await;
    state
        .bus
        .publish(Event::new(RECONCILE_NOW, state.name.as_ref()))
        .await;

    info!(plugin = %state.name, "Reconcile requested");
    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response()
}
