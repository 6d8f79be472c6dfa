//! The module contract.
//!
//! Every long-lived component, including the reconciler, is a [`Module`].
//! Extensions that advertise services to siblings additionally implement
//! [`Plugin`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::registry::Registry;

/// Lifecycle contract of a registered module.
///
/// `init` runs once, in registration order, before any `start`. `start` runs
/// in its own task and may keep running until `cancel` fires. `stop` is called
/// in reverse registration order; `deadline` fires when shutdown stops waiting.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Read configuration, register routes and subscriptions.
    async fn init(&self, registry: &Registry) -> Result<()>;

    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    async fn stop(&self, deadline: CancellationToken) -> Result<()>;
}

/// A module that advertises capabilities and answers synchronous actions.
#[async_trait]
pub trait Plugin: Module {
    fn description(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn status(&self) -> ServiceStatus;

    /// Run a request/response action such as `get_secrets`.
    async fn execute(&self, action: &str, params: &Map<String, Value>) -> Result<Value>;

    /// Redacted configuration shown by introspection.
    fn config_view(&self) -> Option<Value> {
        None
    }

    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Service advertised by a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Answers `get_secrets` with environment values for a unit.
    Secrets,
    Notifier,
    /// Requests reconciliation from outside the timer.
    Trigger,
    Api,
    Ui,
    Monitor,
}

impl Capability {
    pub const ALL: [Self; 6] = [
        Self::Secrets,
        Self::Notifier,
        Self::Trigger,
        Self::Api,
        Self::Ui,
        Self::Monitor,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Secrets => "secrets",
            Self::Notifier => "notifier",
            Self::Trigger => "trigger",
            Self::Api => "api",
            Self::Ui => "ui",
            Self::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|cap| cap.as_str() == s)
            .ok_or_else(|| Error::invalid_params(format!("unknown capability '{s}'")))
    }
}

/// Health reported by a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    Degraded,
    #[default]
    Unknown,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A registered module, keeping the plugin refinement visible.
#[derive(Clone)]
pub enum Registered {
    Module(Arc<dyn Module>),
    Plugin(Arc<dyn Plugin>),
}

impl Registered {
    pub fn module(module: impl Module + 'static) -> Self {
        Self::Module(Arc::new(module))
    }

    pub fn plugin(plugin: impl Plugin + 'static) -> Self {
        Self::Plugin(Arc::new(plugin))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Module(m) => m.name(),
            Self::Plugin(p) => p.name(),
        }
    }

    pub fn as_plugin(&self) -> Option<&Arc<dyn Plugin>> {
        match self {
            Self::Module(_) => None,
            Self::Plugin(p) => Some(p),
        }
    }

    pub(crate) async fn init(&self, registry: &Registry) -> Result<()> {
        match self {
            Self::Module(m) => m.init(registry).await,
            Self::Plugin(p) => p.init(registry).await,
        }
    }

    pub(crate) async fn start(&self, cancel: CancellationToken) -> Result<()> {
        match self {
            Self::Module(m) => m.start(cancel).await,
            Self::Plugin(p) => p.start(cancel).await,
        }
    }

    pub(crate) async fn stop(&self, deadline: CancellationToken) -> Result<()> {
        match self {
            Self::Module(m) => m.stop(deadline).await,
            Self::Plugin(p) => p.stop(deadline).await,
        }
    }
}

impl fmt::Debug for Registered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(m) => f.debug_tuple("Module").field(&m.name()).finish(),
            Self::Plugin(p) => f.debug_tuple("Plugin").field(&p.name()).finish(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn should_round_trip_capability_names() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
            assert_eq!(
                serde_json::to_value(cap).unwrap(),
                Value::String(cap.to_string())
            );
        }
    }

    #[test]
    fn should_reject_unknown_capability() {
        assert!("storage".parse::<Capability>().is_err());
    }

    #[test]
    fn should_serialize_status_lowercase() {
        assert_eq!(
            serde_json::to_string(&ServiceStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(ServiceStatus::default(), ServiceStatus::Unknown);
    }
}
