//! Extension discovery.
//!
//! An extension directory holds YAML manifests naming a registered
//! constructor. Manifests load in ascending filename order, which is the only
//! precedence control between extensions offering the same capability.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::module::Registered;

/// Contents of one extension manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionManifest {
    /// Constructor key in the [`ExtensionCatalog`].
    pub kind: String,
    /// Instance name; the constructor picks a default when absent.
    #[serde(default)]
    pub name: Option<String>,
}

impl ExtensionManifest {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
        }
    }

    /// The configured instance name, or `default` when none was given.
    pub fn name_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(default)
    }
}

/// Builds a module from its manifest.
pub type Constructor = Box<dyn Fn(&ExtensionManifest) -> Result<Registered> + Send + Sync>;

/// Table of known extension kinds.
#[derive(Default)]
pub struct ExtensionCatalog {
    constructors: BTreeMap<String, Constructor>,
}

impl ExtensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constructor, replacing any previous one for `kind`.
    #[must_use]
    pub fn with<F>(mut self, kind: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&ExtensionManifest) -> Result<Registered> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Box::new(constructor));
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// # Errors
    ///
    /// Returns `UnknownKind` when no constructor matches, or the constructor's error.
    pub fn construct(&self, manifest: &ExtensionManifest) -> Result<Registered> {
        let constructor = self
            .constructors
            .get(&manifest.kind)
            .ok_or_else(|| Error::UnknownKind {
                kind: manifest.kind.clone(),
            })?;
        constructor(manifest)
    }
}

impl fmt::Debug for ExtensionCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionCatalog")
            .field("kinds", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Outcome of scanning an extension directory.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Constructed modules in filename order.
    pub loaded: Vec<(PathBuf, Registered)>,
    /// Manifests that were skipped, with the reason.
    pub skipped: Vec<Error>,
}

/// Scan `dir` for `*.yaml` / `*.yml` manifests and construct each one.
///
/// A missing directory yields nothing. Every failure is logged and recorded in
/// [`Discovery::skipped`]; one bad manifest never stops the rest.
pub fn discover(dir: &Path, catalog: &ExtensionCatalog) -> Discovery {
    let mut discovery = Discovery::default();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Extension directory unavailable, no extensions loaded");
            return discovery;
        }
    };

    let mut manifests: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_manifest(path))
        .collect();
    manifests.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    for path in manifests {
        match load_manifest(&path).and_then(|manifest| {
            catalog
                .construct(&manifest)
                .map_err(|e| Error::load(&path, e.to_string()))
        }) {
            Ok(module) => {
                info!(path = %path.display(), module = module.name(), "Loaded extension");
                discovery.loaded.push((path, module));
            }
            Err(e) => {
                warn!(error = %e, "Skipping extension");
                discovery.skipped.push(e);
            }
        }
    }

    debug!(
        loaded = discovery.loaded.len(),
        skipped = discovery.skipped.len(),
        "Extension discovery finished"
    );
    discovery
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

fn load_manifest(path: &Path) -> Result<ExtensionManifest> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::load(path, e.to_string()))?;
    let manifest: ExtensionManifest =
        serde_yaml::from_str(&text).map_err(|e| Error::load(path, e.to_string()))?;
    if manifest.kind.trim().is_empty() {
        return Err(Error::load(path, "manifest kind is empty"));
    }
    Ok(manifest)
}
