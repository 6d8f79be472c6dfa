//! # fleetsync
//!
//! Daemon wiring: configuration resolution, module registration and the
//! run loop behind the `fleetsync` binary.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod app;
pub mod cli;

pub use app::{Daemon, resolve_config};
pub use cli::{Cli, LogFormat};
