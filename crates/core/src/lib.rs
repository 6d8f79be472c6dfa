//! Shared building blocks for fleetsync.
//!
//! - **Unit identity**: `owner/name` keys shared by every set the reconciler computes
//! - **Configuration**: sectioned config map merged from environment and YAML
//! - **Secrets**: values that serialize as a redaction marker

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod secret;
pub mod unit;

pub use config::{ConfigMap, CoreConfig, Section, decode_section, normalize_list, string_or_list};
pub use error::{Error, Result};
pub use secret::{REDACTION_MARKER, Secret};
pub use unit::UnitId;
