//! Secret aggregation across `secrets`-capable plugins.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetsync_core::UnitId;
use fleetsync_modules::Plugin;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Action name every secret provider answers.
pub const GET_SECRETS: &str = "get_secrets";

/// A key returned by more than one provider. Values are never recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretConflict {
    pub key: String,
    pub kept_from: String,
    pub discarded_from: String,
}

/// Merged environment for one unit.
#[derive(Debug, Default)]
pub struct SecretSet {
    pub env: BTreeMap<String, String>,
    pub conflicts: Vec<SecretConflict>,
}

/// Ask each provider, in order, for the unit's secrets. The first provider to
/// return a key wins.
///
/// # Errors
///
/// `SecretsFailed` as soon as one provider errors or answers with something
/// other than a flat object.
pub async fn aggregate(providers: &[Arc<dyn Plugin>], unit: &UnitId) -> Result<SecretSet> {
    let params: Map<String, Value> = [
        ("owner".to_string(), Value::from(unit.owner())),
        ("name".to_string(), Value::from(unit.name())),
        ("unit".to_string(), Value::from(unit.to_string())),
    ]
    .into_iter()
    .collect();

    let mut set = SecretSet::default();
    let mut origin: BTreeMap<String, String> = BTreeMap::new();

    for provider in providers {
        let name = provider.name();
        let answer = provider
            .execute(GET_SECRETS, &params)
            .await
            .map_err(|e| Error::secrets_failed(name, e))?;

        let values = match answer {
            Value::Object(values) => values,
            Value::Null => Map::new(),
            other => {
                return Err(Error::secrets_failed(
                    name,
                    format!("expected an object, got {}", kind_of(&other)),
                ));
            }
        };
        debug!(plugin = name, unit = %unit, keys = values.len(), "Fetched secrets");

        for (key, value) in values {
            let value = scalar_to_string(value).ok_or_else(|| {
                Error::secrets_failed(name, format!("value of '{key}' is not a scalar"))
            })?;

            if let Some(kept_from) = origin.get(&key) {
                set.conflicts.push(SecretConflict {
                    key,
                    kept_from: kept_from.clone(),
                    discarded_from: name.to_string(),
                });
                continue;
            }
            origin.insert(key.clone(), name.to_string());
            set.env.insert(key, value);
        }
    }
    Ok(set)
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
