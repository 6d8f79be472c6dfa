//! Core types for the reconciler.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use fleetsync_core::UnitId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// File whose content drives change detection.
pub const DESCRIPTOR_FILE: &str = "docker-compose.yml";

/// Per-unit hook root, both remotely and on disk.
pub const HOOKS_DIR: &str = ".deploy";

/// Only files with this suffix are treated as hooks.
pub const HOOK_SUFFIX: &str = ".sh";

/// `source` of every event the reconciler publishes.
pub const EVENT_SOURCE: &str = "reconciler";

/// A unit as reported by the source provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUnit {
    pub id: UnitId,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Provider-specific attributes, passed through untouched.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RemoteUnit {
    pub fn new(id: UnitId) -> Self {
        Self {
            id,
            archived: false,
            topics: Vec::new(),
            metadata: Map::new(),
        }
    }
}

/// Kind of a remote directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    #[serde(other)]
    Other,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    /// Path relative to the unit root.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: EntryKind::File,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Discovery query, rendered as `user:<id> topic:<tag> [archived:<bool>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub user: String,
    pub topic: String,
    pub archived: Option<bool>,
}

impl SearchQuery {
    /// Units carrying `topic` that are not archived.
    pub fn desired(user: &str, topic: &str) -> Self {
        Self {
            user: user.to_string(),
            topic: topic.to_string(),
            archived: Some(false),
        }
    }

    /// Units explicitly marked for removal.
    pub fn removal(user: &str, remove_topic: &str) -> Self {
        Self {
            user: user.to_string(),
            topic: remove_topic.to_string(),
            archived: None,
        }
    }

    /// Archived units still carrying `topic`.
    pub fn archived(user: &str, topic: &str) -> Self {
        Self {
            user: user.to_string(),
            topic: topic.to_string(),
            archived: Some(true),
        }
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user:{} topic:{}", self.user, self.topic)?;
        if let Some(archived) = self.archived {
            write!(f, " archived:{archived}")?;
        }
        Ok(())
    }
}

/// Units that should be deployed, keyed by identity.
pub type DesiredSet = BTreeMap<UnitId, RemoteUnit>;

/// Units that must be torn down.
pub type RemovalSet = BTreeSet<UnitId>;

/// Classification of a unit against one cycle's desired and removal sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Desired only: deploy.
    Deploy,
    /// Removal only: prune.
    Prune,
    /// In both sets: skip and warn.
    Conflict,
    /// In neither set but present locally: warn, never delete.
    Untracked,
}

impl UnitState {
    pub fn classify(id: &UnitId, desired: &DesiredSet, removal: &RemovalSet) -> Self {
        match (desired.contains_key(id), removal.contains(id)) {
            (true, false) => Self::Deploy,
            (false, true) => Self::Prune,
            (true, true) => Self::Conflict,
            (false, false) => Self::Untracked,
        }
    }
}

/// Hook stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    Pre,
    Post,
}

impl HookStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }

    /// Remote path of this stage's hooks, relative to the unit root.
    pub fn remote_dir(self) -> String {
        format!("{HOOKS_DIR}/{}", self.as_str())
    }

    /// Local directory of this stage's hooks under a unit directory.
    pub fn unit_dir(self, unit_path: &Path) -> PathBuf {
        unit_path.join(HOOKS_DIR).join(self.as_str())
    }

    /// Local directory of this stage's hooks under the global hooks root.
    pub fn global_dir(self, root: &Path) -> PathBuf {
        root.join(self.as_str())
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running the deploy pipeline for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The unit has no descriptor; nothing to deploy.
    NoDescriptor,
    /// Local descriptor matches; no hooks or executor ran.
    Unchanged,
    Deployed,
    /// Dry run: a deploy was needed but nothing was changed.
    WouldDeploy,
}

/// A unit that failed during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: UnitId,
    pub error: String,
}

/// Summary of one reconciliation cycle.
///
/// In a dry run `deployed` and `pruned` list what would have happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub dry_run: bool,
    pub desired: usize,
    pub removal: usize,
    /// Discovery queries that failed this cycle.
    pub query_failures: usize,
    pub deployed: Vec<UnitId>,
    pub unchanged: Vec<UnitId>,
    /// Desired units without a descriptor.
    pub skipped: Vec<UnitId>,
    pub failed: Vec<UnitFailure>,
    pub pruned: Vec<UnitId>,
    pub prune_failed: Vec<UnitFailure>,
    /// Marked for removal, but kept because the owner's desired query failed.
    pub held: Vec<UnitId>,
    pub conflicts: Vec<UnitId>,
    pub divergent: Vec<UnitId>,
}

impl CycleReport {
    /// Whether the cycle changed or wanted to change nothing and nothing failed.
    pub fn converged(&self) -> bool {
        self.deployed.is_empty()
            && self.pruned.is_empty()
            && self.failed.is_empty()
            && self.prune_failed.is_empty()
            && self.query_failures == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn id(s: &str) -> UnitId {
        s.parse().unwrap()
    }

    #[test]
    fn should_render_queries_in_provider_grammar() {
        assert_eq!(
            SearchQuery::desired("alice", "homelab").to_string(),
            "user:alice topic:homelab archived:false"
        );
        assert_eq!(
            SearchQuery::removal("alice", "homelab-remove").to_string(),
            "user:alice topic:homelab-remove"
        );
        assert_eq!(
            SearchQuery::archived("alice", "homelab").to_string(),
            "user:alice topic:homelab archived:true"
        );
    }

    #[test]
    fn should_classify_every_combination() {
        let desired: DesiredSet = [id("a/deploy"), id("a/both")]
            .into_iter()
            .map(|u| (u.clone(), RemoteUnit::new(u)))
            .collect();
        let removal: RemovalSet = [id("a/prune"), id("a/both")].into_iter().collect();

        assert_eq!(UnitState::classify(&id("a/deploy"), &desired, &removal), UnitState::Deploy);
        assert_eq!(UnitState::classify(&id("a/prune"), &desired, &removal), UnitState::Prune);
        assert_eq!(UnitState::classify(&id("a/both"), &desired, &removal), UnitState::Conflict);
        assert_eq!(UnitState::classify(&id("a/other"), &desired, &removal), UnitState::Untracked);
    }

    #[test]
    fn should_lay_out_hook_directories() {
        let unit = Path::new("stacks/alice/app");
        assert_eq!(
            HookStage::Pre.unit_dir(unit),
            PathBuf::from("stacks/alice/app/.deploy/pre")
        );
        assert_eq!(HookStage::Post.remote_dir(), ".deploy/post");
        assert_eq!(
            HookStage::Post.global_dir(Path::new("/etc/hooks")),
            PathBuf::from("/etc/hooks/post")
        );
    }

    #[test]
    fn should_parse_listing_entries_with_unknown_kinds() {
        let entries: Vec<RemoteEntry> = serde_json::from_str(
            r#"[{"name":"01.sh","path":".deploy/pre/01.sh","type":"file"},
                {"name":"lib","path":".deploy/pre/lib","type":"dir"},
                {"name":"link","path":".deploy/pre/link","type":"symlink"}]"#,
        )
        .unwrap();
        let kinds: Vec<EntryKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EntryKind::File, EntryKind::Dir, EntryKind::Other]);
    }

    #[test]
    fn should_report_convergence() {
        let mut report = CycleReport::default();
        assert!(report.converged());
        report.unchanged.push(id("a/b"));
        assert!(report.converged(), "unchanged units do not break convergence");
        report.deployed.push(id("a/c"));
        assert!(!report.converged());
    }
}
