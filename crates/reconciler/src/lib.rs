//! Reconciliation loop converging a local fleet of compose units onto
//! topic-tagged repositories.
//!
//! Every cycle:
//!
//! 1. Queries the source for the **desired** set (topic, not archived) and the
//!    **removal** set (removal topic, or archived with the topic)
//! 2. Classifies every local `<owner>/<name>` directory against both sets
//! 3. Prunes units marked for removal, warns about conflicts and untracked units
//! 4. Runs the deploy pipeline for every desired unit not marked for removal
//!
//! # Units
//!
//! | desired | removal | action |
//! |---|---|---|
//! | yes | no | deploy |
//! | no | yes | prune |
//! | yes | yes | skip, `notify_state_conflict` |
//! | no | no | keep, `notify_divergence` |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fleetsync_events::EventBus;
//! use fleetsync_reconciler::{ComposeExecutor, GitHubSource, Reconciler, ReconcilerConfig};
//!
//! let source = Arc::new(GitHubSource::new(reqwest::Client::new(), "https://api.github.com", token)?);
//! let reconciler = Reconciler::new(
//!     source,
//!     Arc::new(ComposeExecutor::new()),
//!     Vec::new(),
//!     Arc::new(EventBus::new()),
//!     ReconcilerConfig::from_core(&core),
//! );
//! let report = reconciler.run_cycle().await;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod executor;
pub mod hooks;
pub mod module;
pub mod pipeline;
pub mod reconciler;
pub mod secrets;
pub mod source;
pub mod types;

pub use error::{Error, Result};
pub use executor::{ComposeExecutor, DeploymentExecutor};
pub use module::ReconcilerModule;
pub use pipeline::{DeployPipeline, PipelineConfig};
pub use reconciler::{DesiredState, Reconciler, ReconcilerConfig};
pub use secrets::{SecretConflict, SecretSet};
pub use source::{GitHubSource, SourceProvider};
pub use types::{
    CycleReport, DeployOutcome, DesiredSet, EntryKind, HookStage, RemoteEntry, RemoteUnit,
    RemovalSet, SearchQuery, UnitFailure, UnitState,
};
