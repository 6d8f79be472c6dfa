//! Module system for fleetsync.
//!
//! - **Contract**: [`Module`] lifecycle plus the [`Plugin`] refinement with capabilities
//! - **Manager**: sequential init, concurrent start, reverse-order stop
//! - **Discovery**: YAML manifests resolved through an [`ExtensionCatalog`] in filename order
//! - **Registry**: config copy, shared HTTP client, route table and event bus for each module

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod api;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod module;
pub mod registry;

pub use api::PluginInfo;
pub use discovery::{Discovery, ExtensionCatalog, ExtensionManifest, discover};
pub use error::{Error, Result};
pub use manager::ModuleManager;
pub use module::{Capability, Module, Plugin, Registered, ServiceStatus};
pub use registry::{Registry, RouteTable};
