//! Hook scripts: fetching per-unit stages and running a stage in order.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fleetsync_core::UnitId;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::source::SourceProvider;
use crate::types::{HOOK_SUFFIX, HookStage};

/// Environment handed to every hook of a unit.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub unit: UnitId,
    pub unit_path: PathBuf,
}

impl HookContext {
    pub fn new(unit: UnitId, unit_path: impl Into<PathBuf>) -> Self {
        Self {
            unit,
            unit_path: unit_path.into(),
        }
    }

    pub fn env(&self) -> [(&'static str, String); 3] {
        [
            ("REPO_NAME", self.unit.name().to_string()),
            ("REPO_OWNER", self.unit.owner().to_string()),
            ("TARGET_DIR", self.unit_path.display().to_string()),
        ]
    }
}

fn is_hook_name(name: &str) -> bool {
    name.ends_with(HOOK_SUFFIX)
        && name.len() > HOOK_SUFFIX.len()
        && !name.contains(['/', '\\'])
        && name != ".."
}

/// Hook scripts in `dir`, sorted by file name. A missing directory has none.
///
/// # Errors
///
/// Fails if the directory exists but cannot be read.
pub async fn list_hooks(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(dir, &e)),
    };

    let mut hooks = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(dir, &e))? {
        let file_type = entry.file_type().await.map_err(|e| Error::io(entry.path(), &e))?;
        if file_type.is_dir() {
            continue;
        }
        if entry.file_name().to_str().is_some_and(is_hook_name) {
            hooks.push(entry.path());
        }
    }
    hooks.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(hooks)
}

/// Run every hook in `dir` in file name order, stopping at the first failure.
///
/// Returns how many hooks ran.
///
/// # Errors
///
/// `HookFailed` for a script that cannot be spawned or exits non-zero.
pub async fn run_stage(dir: &Path, stage: HookStage, ctx: &HookContext) -> Result<usize> {
    let hooks = list_hooks(dir).await?;
    for script in &hooks {
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(unit = %ctx.unit, stage = %stage, script = %name, "Running hook");

        // The child runs inside the unit directory, so a relative script path
        // must be resolved against our own working directory first.
        let script = std::path::absolute(script)
            .map_err(|e| Error::hook_failed(stage.as_str(), &name, e))?;
        let mut command = Command::new(&script);
        command.envs(ctx.env()).kill_on_drop(true);
        if ctx.unit_path.is_dir() {
            command.current_dir(&ctx.unit_path);
        }
        let output = command
            .output()
            .await
            .map_err(|e| Error::hook_failed(stage.as_str(), &name, e))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(unit = %ctx.unit, script = %name, "{line}");
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!(unit = %ctx.unit, script = %name, "{line}");
        }

        if !output.status.success() {
            return Err(Error::hook_failed(stage.as_str(), &name, output.status));
        }
    }
    Ok(hooks.len())
}

/// Mirror the unit's remote `stage` hooks into its local hook directory.
///
/// A remote stage that does not exist clears the local one. Local scripts no
/// longer present remotely are removed. Returns how many scripts were written.
///
/// # Errors
///
/// `HookFetchFailed` if the listing, a script download or a local write fails.
pub async fn sync_stage(
    source: &dyn SourceProvider,
    unit: &UnitId,
    unit_path: &Path,
    stage: HookStage,
) -> Result<usize> {
    let local_dir = stage.unit_dir(unit_path);
    let fetch_failed = |reason: String| Error::hook_fetch_failed(stage.as_str(), reason);

    let Some(listing) = source
        .list_directory(unit, &stage.remote_dir())
        .await
        .map_err(|e| fetch_failed(e.to_string()))?
    else {
        debug!(unit = %unit, stage = %stage, "No remote hooks");
        return match tokio::fs::remove_dir_all(&local_dir).await {
            Ok(()) => Ok(0),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(fetch_failed(Error::io(&local_dir, &e).to_string())),
        };
    };

    tokio::fs::create_dir_all(&local_dir)
        .await
        .map_err(|e| fetch_failed(Error::io(&local_dir, &e).to_string()))?;

    let mut written = BTreeSet::new();
    for entry in listing.iter().filter(|e| e.is_file() && is_hook_name(&e.name)) {
        let Some(content) = source
            .file_content(unit, &entry.path)
            .await
            .map_err(|e| fetch_failed(e.to_string()))?
        else {
            warn!(unit = %unit, script = %entry.name, "Hook vanished during fetch");
            continue;
        };

        let path = local_dir.join(&entry.name);
        write_executable(&path, &content)
            .await
            .map_err(|e| fetch_failed(Error::io(&path, &e).to_string()))?;
        written.insert(entry.name.clone());
    }

    for stale in list_hooks(&local_dir).await? {
        let is_stale = stale
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !written.contains(n));
        if is_stale {
            debug!(unit = %unit, script = %stale.display(), "Removing stale hook");
            tokio::fs::remove_file(&stale)
                .await
                .map_err(|e| fetch_failed(Error::io(&stale, &e).to_string()))?;
        }
    }

    debug!(unit = %unit, stage = %stage, hooks = written.len(), "Fetched hooks");
    Ok(written.len())
}

async fn write_executable(path: &Path, content: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, content).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::types::{RemoteEntry, RemoteUnit, SearchQuery};

    fn script(dir: &Path, name: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn ctx(root: &Path) -> HookContext {
        HookContext::new(UnitId::new("alice", "app"), root.join("alice/app"))
    }

    #[tokio::test]
    async fn should_run_hooks_in_lexical_order() {
        let tmp = TempDir::new().unwrap();
        let hooks = tmp.path().join("pre");
        let log = tmp.path().join("order.log");
        for name in ["10-c.sh", "02-b.sh", "01-a.sh"] {
            script(&hooks, name, &format!("echo {name} >> {}", log.display()));
        }
        script(&hooks, "README.md", "exit 1");

        let ran = run_stage(&hooks, HookStage::Pre, &ctx(tmp.path())).await.unwrap();

        assert_eq!(ran, 3, "non-.sh files are ignored");
        let order = std::fs::read_to_string(&log).unwrap();
        assert_eq!(order.lines().collect::<Vec<_>>(), vec!["01-a.sh", "02-b.sh", "10-c.sh"]);
    }

    #[tokio::test]
    async fn should_inject_unit_environment() {
        let tmp = TempDir::new().unwrap();
        let hooks = tmp.path().join("post");
        let out = tmp.path().join("env.out");
        script(
            &hooks,
            "01-env.sh",
            &format!(r#"echo "$REPO_OWNER $REPO_NAME $TARGET_DIR" > {}"#, out.display()),
        );

        let context = ctx(tmp.path());
        run_stage(&hooks, HookStage::Post, &context).await.unwrap();

        let recorded = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            recorded.trim(),
            format!("alice app {}", context.unit_path.display())
        );
    }

    #[tokio::test]
    async fn should_stop_at_first_failing_hook() {
        let tmp = TempDir::new().unwrap();
        let hooks = tmp.path().join("pre");
        let marker = tmp.path().join("ran-second");
        script(&hooks, "01-fail.sh", "exit 7");
        script(&hooks, "02-after.sh", &format!("touch {}", marker.display()));

        let err = run_stage(&hooks, HookStage::Pre, &ctx(tmp.path())).await.unwrap_err();

        assert!(matches!(&err, Error::HookFailed { script, .. } if script == "01-fail.sh"));
        assert!(!marker.exists(), "hooks after a failure must not run");
    }

    #[tokio::test]
    async fn should_treat_missing_directory_as_empty() {
        let tmp = TempDir::new().unwrap();
        let ran = run_stage(&tmp.path().join("absent"), HookStage::Pre, &ctx(tmp.path()))
            .await
            .unwrap();
        assert_eq!(ran, 0);
    }

    #[derive(Default)]
    struct Listing {
        dirs: BTreeMap<String, Vec<RemoteEntry>>,
        files: BTreeMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl SourceProvider for Listing {
        async fn search(&self, _query: &SearchQuery) -> Result<Vec<RemoteUnit>> {
            Ok(Vec::new())
        }
        async fn file_content(&self, _unit: &UnitId, path: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.files.get(path).cloned())
        }
        async fn list_directory(
            &self,
            _unit: &UnitId,
            path: &str,
        ) -> Result<Option<Vec<RemoteEntry>>> {
            Ok(self.dirs.get(path).cloned())
        }
    }

    #[tokio::test]
    async fn should_sync_scripts_and_drop_stale_ones() {
        let tmp = TempDir::new().unwrap();
        let unit_path = tmp.path().join("alice/app");
        let local = HookStage::Pre.unit_dir(&unit_path);
        script(&local, "00-old.sh", "true");

        let mut source = Listing::default();
        source.dirs.insert(
            ".deploy/pre".into(),
            vec![
                RemoteEntry::file("01-migrate.sh", ".deploy/pre/01-migrate.sh"),
                RemoteEntry::file("notes.txt", ".deploy/pre/notes.txt"),
            ],
        );
        source
            .files
            .insert(".deploy/pre/01-migrate.sh".into(), b"#!/bin/sh\ntrue\n".to_vec());

        let written = sync_stage(&source, &UnitId::new("alice", "app"), &unit_path, HookStage::Pre)
            .await
            .unwrap();

        assert_eq!(written, 1);
        let fetched = local.join("01-migrate.sh");
        let mode = std::fs::metadata(&fetched).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755, "hooks are written executable");
        assert!(!local.join("00-old.sh").exists(), "stale hook removed");
        assert!(!local.join("notes.txt").exists(), "non-hook files are not fetched");
    }

    #[tokio::test]
    async fn should_clear_local_stage_when_remote_has_none() {
        let tmp = TempDir::new().unwrap();
        let unit_path = tmp.path().join("alice/app");
        let local = HookStage::Post.unit_dir(&unit_path);
        script(&local, "01-notify.sh", "true");

        let written = sync_stage(
            &Listing::default(),
            &UnitId::new("alice", "app"),
            &unit_path,
            HookStage::Post,
        )
        .await
        .unwrap();

        assert_eq!(written, 0);
        assert!(!local.exists());
    }

    #[test]
    fn test_hook_name_filter() {
        assert!(is_hook_name("01-a.sh"));
        assert!(!is_hook_name(".sh"));
        assert!(!is_hook_name("../evil.sh"));
        assert!(!is_hook_name("setup.py"));
    }
}
