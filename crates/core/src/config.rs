//! Sectioned configuration.
//!
//! Configuration is a map of `section -> key -> value`. The `core` section drives
//! the reconciler; every other section belongs to the extension of the same name.
//! Values come from environment defaults, overridden by an optional YAML file.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::secret::Secret;

/// Name of the section read by [`CoreConfig`].
pub const CORE_SECTION: &str = "core";

/// Default on-disk root of the fleet.
pub const DEFAULT_TARGET_DIR: &str = "./stacks";

/// Default reconciliation interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default source provider endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Environment variables recognized as configuration defaults: (section, key, variable).
const ENV_BINDINGS: &[(&str, &str, &str)] = &[
    ("core", "token", "GITHUB_TOKEN"),
    ("core", "users", "GITHUB_USERS"),
    ("core", "topic", "TOPIC_FILTER"),
    ("core", "remove_topic", "REMOVE_TOPIC"),
    ("core", "target_dir", "TARGET_DIR"),
    ("core", "interval", "SYNC_INTERVAL"),
    ("core", "dry_run", "DRY_RUN"),
    ("core", "global_hooks_dir", "GLOBAL_HOOKS_DIR"),
    ("core", "plugins_dir", "PLUGINS_DIR"),
    ("core", "http_addr", "HTTP_ADDR"),
    ("core", "api_url", "GITHUB_API_URL"),
    ("webhook", "url", "NOTIFY_WEBHOOK_URL"),
    ("webhook", "subscribe", "NOTIFY_WEBHOOK_EVENTS"),
    ("webhook_trigger", "token", "WEBHOOK_TOKEN"),
];

/// One configuration section.
pub type Section = BTreeMap<String, Value>;

/// Sectioned configuration map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigMap(BTreeMap<String, Section>);

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build defaults from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build defaults from an arbitrary variable lookup. Unset and blank
    /// variables are omitted so they cannot shadow file values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut map = Self::new();
        for (section, key, var) in ENV_BINDINGS {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                map.set(section, key, Value::String(value));
            }
        }
        map
    }

    /// Load a YAML configuration file. A missing or empty file is an empty map.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse_yaml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::new())
            }
            Err(e) => Err(Error::file_read_failed(path, e.to_string())),
        }
    }

    /// Parse YAML text. Top-level keys whose values are not mappings are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid YAML or a non-mapping document.
    pub fn parse_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::new());
        }
        let raw: Value =
            serde_yaml::from_str(text).map_err(|e| Error::yaml_parse_failed(e.to_string()))?;
        let Value::Object(sections) = raw else {
            return Err(Error::yaml_parse_failed("top level must be a mapping"));
        };

        Ok(Self(
            sections
                .into_iter()
                .filter_map(|(name, value)| match value {
                    Value::Object(values) => Some((name, values.into_iter().collect())),
                    _ => None,
                })
                .collect(),
        ))
    }

    /// Merge `primary` over `fallback`, key by key. Primary wins.
    pub fn merge(primary: &Self, fallback: &Self) -> Self {
        let mut out = fallback.clone();
        for (name, values) in primary.0.iter().filter(|(_, v)| !v.is_empty()) {
            out.0
                .entry(name.clone())
                .or_default()
                .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.0.get(name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.0.get(section).and_then(|s| s.get(key))
    }

    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        self.0
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Section names in key order.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Decode one section into an extension's typed configuration.
///
/// # Errors
///
/// Returns `InvalidConfig` if the section does not match `T`.
pub fn decode_section<T: DeserializeOwned + Default>(config: &ConfigMap, name: &str) -> Result<T> {
    match config.section(name) {
        Some(section) if !section.is_empty() => {
            let value = Value::Object(section.clone().into_iter().collect());
            serde_json::from_value(value).map_err(|e| Error::invalid_config(name, e.to_string()))
        }
        _ => Ok(T::default()),
    }
}

/// Deserialize either a list or a comma-separated string into a normalized list.
///
/// # Errors
///
/// Fails when the value is neither a string nor a sequence.
pub fn string_or_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<Value>),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::One(s) => s.split(',').map(str::to_string).collect::<Vec<_>>(),
        Raw::Many(values) => values.iter().map(value_to_string).collect(),
    };
    Ok(normalize_list(items))
}

/// Trim, drop blanks and de-duplicate while keeping first-seen order.
pub fn normalize_list(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !out.iter().any(|v| v == value) {
            out.push(value.to_string());
        }
    }
    out
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Typed view of the `core` section.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Source provider token.
    pub token: Secret,
    /// Users or organizations scanned every cycle.
    pub users: Vec<String>,
    /// Topic marking a repository as desired.
    pub topic: String,
    /// Topic marking a repository for explicit removal.
    pub remove_topic: String,
    /// Root of the local fleet, `target_dir/<owner>/<name>`.
    pub target_dir: PathBuf,
    pub interval: Duration,
    pub dry_run: bool,
    /// Hooks shared by every unit, `{pre,post}/*.sh`.
    pub global_hooks_dir: Option<PathBuf>,
    /// Directory of extension manifests.
    pub plugins_dir: Option<PathBuf>,
    pub http_addr: Option<SocketAddr>,
    pub api_url: String,
}

impl CoreConfig {
    /// Read the `core` section.
    ///
    /// # Errors
    ///
    /// Returns `MissingConfig` when token, users or topic are absent, and
    /// `InvalidConfig` for unparsable values.
    pub fn from_map(config: &ConfigMap) -> Result<Self> {
        let empty = Section::new();
        let section = config.section(CORE_SECTION).unwrap_or(&empty);

        let token = string_value(section, &["token", "github_token"])
            .ok_or_else(|| Error::missing_config("core.token"))?;

        let users = section
            .get("users")
            .or_else(|| section.get("github_users"))
            .map(|v| match v {
                Value::Array(items) => normalize_list(items.iter().map(value_to_string)),
                other => normalize_list(value_to_string(other).split(',').map(str::to_string)),
            })
            .unwrap_or_default();
        if users.is_empty() {
            return Err(Error::missing_config("core.users"));
        }

        let topic = string_value(section, &["topic", "topic_filter"])
            .ok_or_else(|| Error::missing_config("core.topic"))?;

        let remove_topic = string_value(section, &["remove_topic"])
            .unwrap_or_else(|| format!("{topic}-remove"));

        let interval = match section.get("interval").or_else(|| section.get("sync_interval")) {
            Some(value) => parse_interval(value)?,
            None => DEFAULT_INTERVAL,
        };

        let http_addr = string_value(section, &["http_addr"])
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|e| Error::invalid_config("core.http_addr", e.to_string()))
            })
            .transpose()?;

        Ok(Self {
            token: Secret::new(token),
            users,
            topic,
            remove_topic,
            target_dir: string_value(section, &["target_dir"])
                .map_or_else(|| PathBuf::from(DEFAULT_TARGET_DIR), PathBuf::from),
            interval,
            dry_run: bool_value(section, "dry_run")?.unwrap_or(false),
            global_hooks_dir: string_value(section, &["global_hooks_dir"]).map(PathBuf::from),
            plugins_dir: string_value(section, &["plugins_dir"]).map(PathBuf::from),
            http_addr,
            api_url: string_value(section, &["api_url"])
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        })
    }
}

fn string_value(section: &Section, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| section.get(*key))
        .map(|v| value_to_string(v).trim().to_string())
        .filter(|v| !v.is_empty())
}

fn bool_value(section: &Section, key: &str) -> Result<Option<bool>> {
    match section.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) => Ok(Some(n.as_f64().is_some_and(|f| f != 0.0))),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" | "" => Ok(Some(false)),
            other => Err(Error::invalid_config(
                format!("core.{key}"),
                format!("'{other}' is not a boolean"),
            )),
        },
        Some(other) => Err(Error::invalid_config(
            format!("core.{key}"),
            format!("'{other}' is not a boolean"),
        )),
    }
}

/// Interval as a humantime string (`5m`, `90s`) or a number of seconds.
fn parse_interval(value: &Value) -> Result<Duration> {
    let interval = match value {
        Value::Number(n) => n
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| Error::invalid_config("core.interval", format!("{n} is not a whole number of seconds")))?,
        Value::String(s) if s.trim().is_empty() => DEFAULT_INTERVAL,
        Value::String(s) => match s.trim().parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => humantime::parse_duration(s.trim())
                .map_err(|e| Error::invalid_config("core.interval", e.to_string()))?,
        },
        other => {
            return Err(Error::invalid_config(
                "core.interval",
                format!("unsupported value {other}"),
            ));
        }
    };

    if interval.is_zero() {
        return Err(Error::invalid_config("core.interval", "must be greater than zero"));
    }
    Ok(interval)
}
