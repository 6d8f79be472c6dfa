//! Event payloads and type descriptors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleetsync_core::UnitId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEPLOY_SUCCESS: &str = "deploy_success";
pub const DEPLOY_FAILED: &str = "deploy_failed";
pub const DEPLOY_SKIPPED: &str = "deploy_skipped";
pub const PRUNE_SUCCESS: &str = "prune_success";
pub const PRUNE_FAILED: &str = "prune_failed";
pub const RECONCILE_COMPLETED: &str = "reconcile_completed";
pub const NOTIFY_SECRET_CONFLICT: &str = "notify_secret_conflict";
pub const NOTIFY_STATE_CONFLICT: &str = "notify_state_conflict";
pub const NOTIFY_DIVERGENCE: &str = "notify_divergence";

/// Request for an immediate reconciliation cycle.
pub const RECONCILE_NOW: &str = "reconcile_now";
pub const WEBHOOK_RECEIVED: &str = "webhook_received";

/// An ephemeral notification fanned out to subscribers.
///
/// `timestamp` is overwritten by [`crate::EventBus::publish`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// Name of the publishing module.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitId>,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub message: String,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            unit: None,
            details: Map::new(),
            message: String::new(),
        }
    }

    #[must_use]
    pub fn with_unit(mut self, unit: UnitId) -> Self {
        self.unit = Some(unit);
        self
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}

/// One documented payload field of an event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadField {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl PayloadField {
    pub fn required(ty: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(ty: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            description: description.into(),
            required: false,
        }
    }
}

/// Registration metadata for an event type. Used for introspection and
/// required-field warnings, never to reject an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeDesc {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub payload: BTreeMap<String, PayloadField>,
}

impl EventTypeDesc {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            payload: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, field: PayloadField) -> Self {
        self.payload.insert(name.into(), field);
        self
    }

    /// Required fields absent from `event.details`.
    pub fn missing_fields<'a>(&'a self, event: &'a Event) -> impl Iterator<Item = &'a str> + 'a {
        self.payload
            .iter()
            .filter(|(name, field)| field.required && !event.details.contains_key(name.as_str()))
            .map(|(name, _)| name.as_str())
    }
}
