//! Forwards bus events to an HTTP endpoint.
//!
//! Reads its instance section (`webhook` by default):
//!
//! ```yaml
//! webhook:
//!   url: https://hooks.example.net/fleet
//!   subscribe: notify_*, deploy_failed
//! ```

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use fleetsync_core::config::{decode_section, string_or_list};
use fleetsync_events::{Event, listener};
use fleetsync_modules::{Capability, Error, Module, Plugin, Registry, Result, ServiceStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const KIND: &str = "webhook_notifier";
pub const DEFAULT_NAME: &str = "webhook";
pub const DEFAULT_SUBSCRIBE: &str = "notify_*";
pub const NOTIFY: &str = "notify";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookNotifierConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub subscribe: Vec<String>,
}

impl WebhookNotifierConfig {
    /// Subscribed patterns, `notify_*` when none are configured.
    pub fn patterns(&self) -> Vec<String> {
        if self.subscribe.is_empty() {
            vec![DEFAULT_SUBSCRIBE.to_string()]
        } else {
            self.subscribe.clone()
        }
    }
}

struct Delivery {
    name: String,
    url: Option<String>,
    http: reqwest::Client,
}

impl Delivery {
    async fn send(&self, event: &Event) -> Result<()> {
        let Some(url) = &self.url else {
            return Err(Error::execute(&self.name, NOTIFY, "no url configured"));
        };

        let response = self
            .http
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(|e| Error::execute(&self.name, NOTIFY, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::execute(&self.name, NOTIFY, format!("endpoint answered {status}")));
        }
        Ok(())
    }
}

pub struct WebhookNotifier {
    name: String,
    config: OnceLock<WebhookNotifierConfig>,
    delivery: OnceLock<Arc<Delivery>>,
}

impl WebhookNotifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: OnceLock::new(),
            delivery: OnceLock::new(),
        }
    }

    fn enabled(&self) -> bool {
        self.delivery.get().is_some_and(|d| d.url.is_some())
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_NAME)
    }
}

#[async_trait]
impl Module for WebhookNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, registry: &Registry) -> Result<()> {
        if self.config.get().is_some() {
            return Err(Error::init(&self.name, "module initialized twice"));
        }
        let config: WebhookNotifierConfig = decode_section(&registry.config(), &self.name)?;
        let delivery = Arc::new(Delivery {
            name: self.name.clone(),
            url: config.url.clone().filter(|u| !u.trim().is_empty()),
            http: registry.http_client(),
        });

        if delivery.url.is_none() {
            warn!(plugin = %self.name, "No webhook url configured, notifier disabled");
        } else {
            for pattern in config.patterns() {
                let delivery = Arc::clone(&delivery);
                registry
                    .subscribe(
                        pattern.as_str(),
                        listener(move |event| {
                            let delivery = Arc::clone(&delivery);
                            async move {
                                match delivery.send(&event).await {
                                    Ok(()) => debug!(
                                        plugin = %delivery.name,
                                        event_type = %event.event_type,
                                        "Webhook delivered"
                                    ),
                                    Err(e) => warn!(
                                        plugin = %delivery.name,
                                        event_type = %event.event_type,
                                        error = %e,
                                        "Webhook delivery failed"
                                    ),
                                }
                            }
                        }),
                    )
                    .await;
            }
            info!(plugin = %self.name, patterns = ?config.patterns(), "Webhook notifier subscribed");
        }

        self.delivery
            .set(delivery)
            .map_err(|_| Error::init(&self.name, "module initialized twice"))?;
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
impl Plugin for WebhookNotifier {
    fn description(&self) -> &str {
        "Posts bus events to a webhook url"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Notifier]
    }

    fn status(&self) -> ServiceStatus {
        match self.delivery.get() {
            None => ServiceStatus::Unknown,
            Some(_) if self.enabled() => ServiceStatus::Healthy,
            Some(_) => ServiceStatus::Unhealthy,
        }
    }

    async fn execute(&self, action: &str, params: &Map<String, Value>) -> Result<Value> {
        if action != NOTIFY {
            return Err(Error::unsupported_action(&self.name, action));
        }
        let event = params
            .get("event")
            .cloned()
            .ok_or_else(|| Error::invalid_params("missing 'event'"))
            .and_then(|v| {
                serde_json::from_value::<Event>(v).map_err(|e| Error::invalid_params(e.to_string()))
            })?;
        let delivery = self
            .delivery
            .get()
            .ok_or_else(|| Error::execute(&self.name, action, "not initialized"))?;

        delivery.send(&event).await?;
        Ok(json!({ "status": "delivered" }))
    }

    fn config_view(&self) -> Option<Value> {
        let config = self.config.get()?;
        Some(json!({ "url": config.url, "subscribe": config.patterns() }))
    }
}
