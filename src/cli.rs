//! CLI definitions using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// fleetsync - converge a compose fleet onto topic-tagged repositories
#[derive(Parser, Debug)]
#[command(name = "fleetsync")]
#[command(version)]
#[command(about = "Continuous reconciliation daemon for docker compose units")]
#[command(
    long_about = "fleetsync discovers repositories tagged with a topic, deploys their compose descriptors under a target directory and prunes units tagged for removal. Settings come from environment variables and an optional YAML file."
)]
pub struct Cli {
    /// YAML configuration file; its values take precedence over the environment
    #[arg(short, long, env = "FLEETSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log intended actions without changing anything
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Run a single reconciliation cycle and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Time allowed for modules to stop after a shutdown signal
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,
}
