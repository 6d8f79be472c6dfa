//! Shared fakes for reconciler integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleetsync_core::UnitId;
use fleetsync_events::{Event, EventBus, listener};
use fleetsync_modules::{Capability, Module, Plugin, Registry, ServiceStatus};
use fleetsync_reconciler::{
    DeploymentExecutor, Error, Reconciler, ReconcilerConfig, RemoteEntry, RemoteUnit, Result,
    SearchQuery, SourceProvider,
};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "homelab";
pub const REMOVE_TOPIC: &str = "homelab-remove";

pub fn id(s: &str) -> UnitId {
    s.parse().unwrap()
}

/// In-memory source provider. Unit files live under `(unit, path)`.
#[derive(Default)]
pub struct FakeSource {
    desired: Mutex<BTreeMap<String, Vec<UnitId>>>,
    removal: Mutex<BTreeMap<String, Vec<UnitId>>>,
    archived: Mutex<BTreeMap<String, Vec<UnitId>>>,
    files: Mutex<BTreeMap<(UnitId, String), Vec<u8>>>,
    failing_users: Mutex<BTreeSet<String>>,
    failing_desired: Mutex<BTreeSet<String>>,
    searches: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn desire(&self, unit: &str) {
        let unit = id(unit);
        self.desired
            .lock()
            .unwrap()
            .entry(unit.owner().to_string())
            .or_default()
            .push(unit);
    }

    pub fn mark_removal(&self, unit: &str) {
        let unit = id(unit);
        self.removal
            .lock()
            .unwrap()
            .entry(unit.owner().to_string())
            .or_default()
            .push(unit);
    }

    pub fn archive(&self, unit: &str) {
        let unit = id(unit);
        self.archived
            .lock()
            .unwrap()
            .entry(unit.owner().to_string())
            .or_default()
            .push(unit);
    }

    pub fn fail_searches_for(&self, user: &str) {
        self.failing_users.lock().unwrap().insert(user.to_string());
    }

    /// Fail only the desired-state query of `user`; removal queries still answer.
    pub fn fail_desired_for(&self, user: &str) {
        self.failing_desired.lock().unwrap().insert(user.to_string());
    }

    pub fn put_file(&self, unit: &str, path: &str, content: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .unwrap()
            .insert((id(unit), path.to_string()), content.into());
    }

    pub fn set_descriptor(&self, unit: &str, content: &str) {
        self.put_file(unit, "docker-compose.yml", content);
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceProvider for FakeSource {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RemoteUnit>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.failing_users.lock().unwrap().contains(&query.user) {
            return Err(Error::source_failed("search", "503 Service Unavailable"));
        }

        let table = match (query.topic.as_str(), query.archived) {
            (REMOVE_TOPIC, _) => &self.removal,
            (_, Some(true)) => &self.archived,
            _ => {
                if self.failing_desired.lock().unwrap().contains(&query.user) {
                    return Err(Error::source_failed("search", "502 Bad Gateway"));
                }
                &self.desired
            }
        };
        Ok(table
            .lock()
            .unwrap()
            .get(&query.user)
            .into_iter()
            .flatten()
            .map(|unit| RemoteUnit {
                archived: query.archived == Some(true),
                topics: vec![query.topic.clone()],
                ..RemoteUnit::new(unit.clone())
            })
            .collect())
    }

    async fn file_content(&self, unit: &UnitId, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&(unit.clone(), path.to_string()))
            .cloned())
    }

    async fn list_directory(&self, unit: &UnitId, path: &str) -> Result<Option<Vec<RemoteEntry>>> {
        let prefix = format!("{path}/");
        let files = self.files.lock().unwrap();
        let mut entries: Vec<RemoteEntry> = files
            .keys()
            .filter(|(owner, file)| owner == unit && file.starts_with(&prefix))
            .map(|(_, file)| {
                let name = file.trim_start_matches(&prefix).to_string();
                RemoteEntry::file(name, file.clone())
            })
            .collect();
        if entries.is_empty() {
            return Ok(None);
        }
        // Listings are not guaranteed to be sorted.
        entries.reverse();
        Ok(Some(entries))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Up {
        path: PathBuf,
        env: BTreeMap<String, String>,
    },
    Down {
        path: PathBuf,
    },
}

/// Executor that records calls, optionally appending `up` to a journal file.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<Call>>,
    journal: Option<PathBuf>,
    fail_up: bool,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn journaling(journal: &Path) -> Arc<Self> {
        Arc::new(Self {
            journal: Some(journal.to_path_buf()),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_up: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ups(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Up { .. }))
            .count()
    }

    pub fn downs(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Down { .. }))
            .count()
    }
}

#[async_trait]
impl DeploymentExecutor for RecordingExecutor {
    async fn up(&self, unit_path: &Path, env: &BTreeMap<String, String>) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Up {
            path: unit_path.to_path_buf(),
            env: env.clone(),
        });
        if let Some(journal) = &self.journal {
            append_line(journal, "up");
        }
        if self.fail_up {
            return Err(Error::executor("up", unit_path, "exit status: 1"));
        }
        Ok(())
    }

    async fn down(&self, unit_path: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Down {
            path: unit_path.to_path_buf(),
        });
        Ok(())
    }
}

pub fn append_line(path: &Path, line: &str) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(file, "{line}").unwrap();
}

pub fn journal_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Shell hook that appends `label` to `journal`, then exits with `code`.
pub fn hook_script(journal: &Path, label: &str, code: i32) -> String {
    format!(
        "#!/bin/sh\necho {label} >> '{}'\nexit {code}\n",
        journal.display()
    )
}

/// `secrets`-capable plugin answering `get_secrets` with a fixed map.
pub struct FakeSecrets {
    name: String,
    values: BTreeMap<String, String>,
    fail: bool,
}

impl FakeSecrets {
    pub fn new(name: &str, values: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            values: values
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            fail: false,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, &[])
        }
    }
}

#[async_trait]
impl Module for FakeSecrets {
    fn name(&self) -> &str {
        &self.name
    }
    async fn init(&self, _registry: &Registry) -> fleetsync_modules::Result<()> {
        Ok(())
    }
    async fn start(&self, _cancel: CancellationToken) -> fleetsync_modules::Result<()> {
        Ok(())
    }
    async fn stop(&self, _deadline: CancellationToken) -> fleetsync_modules::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Plugin for FakeSecrets {
    fn description(&self) -> &str {
        "static secrets"
    }
    fn capabilities(&self) -> &[Capability] {
        &[Capability::Secrets]
    }
    fn status(&self) -> ServiceStatus {
        ServiceStatus::Healthy
    }
    async fn execute(
        &self,
        action: &str,
        _params: &Map<String, Value>,
    ) -> fleetsync_modules::Result<Value> {
        if self.fail {
            return Err(fleetsync_modules::Error::execute(&self.name, action, "backend sealed"));
        }
        Ok(Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ))
    }
}

pub fn config(root: &Path) -> ReconcilerConfig {
    ReconcilerConfig {
        users: vec!["alice".to_string(), "bob".to_string()],
        topic: TOPIC.to_string(),
        remove_topic: REMOVE_TOPIC.to_string(),
        target_dir: root.join("stacks"),
        global_hooks_dir: None,
        dry_run: false,
    }
}

pub struct Harness {
    pub source: Arc<FakeSource>,
    pub executor: Arc<RecordingExecutor>,
    pub bus: Arc<EventBus>,
    pub events: Arc<Mutex<Vec<Event>>>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub async fn new(
        config: ReconcilerConfig,
        source: Arc<FakeSource>,
        executor: Arc<RecordingExecutor>,
        secrets: Vec<Arc<dyn Plugin>>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let events: Arc<Mutex<Vec<Event>>> = Arc::default();
        let sink = Arc::clone(&events);
        bus.subscribe(
            "*",
            listener(move |event| {
                let sink = Arc::clone(&sink);
                async move { sink.lock().unwrap().push(event) }
            }),
        )
        .await;

        let reconciler = Reconciler::new(
            Arc::clone(&source) as Arc<dyn SourceProvider>,
            Arc::clone(&executor) as Arc<dyn DeploymentExecutor>,
            secrets,
            Arc::clone(&bus),
            config,
        );
        Self {
            source,
            executor,
            bus,
            events,
            reconciler,
        }
    }

    /// Types of the events delivered so far.
    pub async fn event_types(&self) -> Vec<String> {
        self.bus.drain().await;
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub async fn events_of(&self, event_type: &str) -> Vec<Event> {
        self.bus.drain().await;
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}
