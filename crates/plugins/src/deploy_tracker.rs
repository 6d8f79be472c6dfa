//! Latest deploy outcome per unit.
//!
//! # Endpoints
//!
//! - `GET /deployments` - every tracked unit, sorted by unit

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::routing::get;
use chrono::{DateTime, Utc};
use fleetsync_core::UnitId;
use fleetsync_events::event::PRUNE_SUCCESS;
use fleetsync_events::{Event, listener};
use fleetsync_modules::{Capability, Error, Module, Plugin, Registry, Result, ServiceStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const KIND: &str = "deploy_tracker";
pub const DEFAULT_NAME: &str = "deploy_tracker";
pub const DEPLOYMENTS_PATH: &str = "/deployments";
pub const LIST_DEPLOYMENTS: &str = "list_deployments";
const DEPLOY_PATTERN: &str = "deploy_*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub unit: UnitId,
    /// Event type of the latest outcome, e.g. `deploy_failed`.
    pub outcome: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentRecord {
    fn from_event(event: &Event) -> Option<Self> {
        let unit = event.unit.clone()?;
        Some(Self {
            unit,
            outcome: event.event_type.clone(),
            message: event.message.clone(),
            error: event
                .detail("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            timestamp: event.timestamp,
        })
    }
}

type Deployments = Arc<RwLock<BTreeMap<UnitId, DeploymentRecord>>>;

/// Store `record` unless a newer outcome for the unit is already held.
///
/// Listeners run concurrently, so events may arrive out of order.
fn track(deployments: &mut BTreeMap<UnitId, DeploymentRecord>, record: DeploymentRecord) -> bool {
    if deployments
        .get(&record.unit)
        .is_some_and(|held| held.timestamp > record.timestamp)
    {
        return false;
    }
    deployments.insert(record.unit.clone(), record);
    true
}

/// Forget `unit` unless its held outcome is newer than the prune.
fn forget(deployments: &mut BTreeMap<UnitId, DeploymentRecord>, unit: &UnitId, at: DateTime<Utc>) {
    if deployments.get(unit).is_some_and(|held| held.timestamp <= at) {
        deployments.remove(unit);
    }
}

async fn snapshot(deployments: &Deployments) -> Vec<DeploymentRecord> {
    deployments.read().await.values().cloned().collect()
}

pub struct DeployTracker {
    name: String,
    deployments: Deployments,
    ready: OnceLock<()>,
}

impl DeployTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deployments: Arc::default(),
            ready: OnceLock::new(),
        }
    }

    pub async fn deployments(&self) -> Vec<DeploymentRecord> {
        snapshot(&self.deployments).await
    }
}

impl Default for DeployTracker {
    fn default() -> Self {
        Self::new(DEFAULT_NAME)
    }
}

#[async_trait]
impl Module for DeployTracker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, registry: &Registry) -> Result<()> {
        if self.ready.get().is_some() {
            return Err(Error::init(&self.name, "module initialized twice"));
        }

        let deployments = Arc::clone(&self.deployments);
        registry
            .subscribe(
                DEPLOY_PATTERN,
                listener(move |event| {
                    let deployments = Arc::clone(&deployments);
                    async move {
                        let Some(record) = DeploymentRecord::from_event(&event) else {
                            return;
                        };
                        let (unit, outcome) = (record.unit.clone(), record.outcome.clone());
                        if track(&mut *deployments.write().await, record) {
                            debug!(unit = %unit, outcome = %outcome, "Tracked deployment");
                        } else {
                            debug!(unit = %unit, outcome = %outcome, "Ignored stale deployment event");
                        }
                    }
                }),
            )
            .await;

        // A pruned unit has no deployment left to report.
        let deployments = Arc::clone(&self.deployments);
        registry
            .subscribe(
                PRUNE_SUCCESS,
                listener(move |event| {
                    let deployments = Arc::clone(&deployments);
                    async move {
                        if let Some(unit) = &event.unit {
                            forget(&mut *deployments.write().await, unit, event.timestamp);
                        }
                    }
                }),
            )
            .await;

        registry.routes().add(
            DEPLOYMENTS_PATH,
            get(list_deployments).with_state(Arc::clone(&self.deployments)),
        )?;
        info!(plugin = %self.name, path = DEPLOYMENTS_PATH, "Deploy tracker registered");

        self.ready
            .set(())
            .map_err(|()| Error::init(&self.name, "module initialized twice"))
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _deadline: CancellationToken) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Plugin for DeployTracker {
    fn description(&self) -> &str {
        "Tracks the latest deploy outcome of every unit"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Monitor]
    }

    fn status(&self) -> ServiceStatus {
        if self.ready.get().is_some() {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Unknown
        }
    }

    async fn execute(&self, action: &str, _params: &Map<String, Value>) -> Result<Value> {
        if action != LIST_DEPLOYMENTS {
            return Err(Error::unsupported_action(&self.name, action));
        }
        serde_json::to_value(self.deployments().await)
            .map_err(|e| Error::execute(&self.name, action, e))
    }
}

async fn list_deployments(State(deployments): State<Deployments>) -> Json<Vec<DeploymentRecord>> {
    Json(snapshot(&deployments).await)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use fleetsync_events::event::{DEPLOY_FAILED, DEPLOY_SUCCESS};

    use super::*;

    #[test]
    fn should_record_error_detail() {
        let event = Event::new(DEPLOY_FAILED, "reconciler")
            .with_unit("alice/app".parse().unwrap())
            .with_detail("error", "hook 01-migrate.sh failed");

        let record = DeploymentRecord::from_event(&event).unwrap();
        assert_eq!(record.outcome, "deploy_failed");
        assert_eq!(record.error.as_deref(), Some("hook 01-migrate.sh failed"));
    }

    #[test]
    fn should_keep_newer_record_over_late_older_event() {
        let unit: UnitId = "alice/app".parse().unwrap();
        let newer = Event::new(DEPLOY_SUCCESS, "reconciler").with_unit(unit.clone());
        let mut older = Event::new(DEPLOY_FAILED, "reconciler").with_unit(unit.clone());
        older.timestamp = newer.timestamp - chrono::Duration::seconds(30);

        let mut deployments = BTreeMap::new();
        assert!(track(&mut deployments, DeploymentRecord::from_event(&newer).unwrap()));
        assert!(!track(&mut deployments, DeploymentRecord::from_event(&older).unwrap()));
        assert_eq!(deployments[&unit].outcome, "deploy_success");

        forget(&mut deployments, &unit, older.timestamp);
        assert!(deployments.contains_key(&unit), "stale prune keeps newer deploy");
        forget(&mut deployments, &unit, newer.timestamp);
        assert!(deployments.is_empty());
    }

    #[test]
    fn should_ignore_events_without_unit() {
        assert!(DeploymentRecord::from_event(&Event::new(DEPLOY_SUCCESS, "reconciler")).is_none());
    }
}
