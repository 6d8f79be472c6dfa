//! # fleetsync
//!
//! Continuous reconciliation daemon: keeps `<target_dir>/<owner>/<name>`
//! compose units in line with repositories tagged with a topic.
//!
//! ## Shutdown
//!
//! SIGINT (Ctrl+C) or SIGTERM stops the tick loop, lets in-flight cycles and
//! event handlers finish, and gives up after `--shutdown-timeout`.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![forbid(clippy::expect_used)]

use anyhow::Result;
use clap::Parser;
use fleetsync::cli::{Cli, LogFormat};
use fleetsync::{Daemon, resolve_config};
use fleetsync_core::ConfigMap;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let (config, core) = resolve_config(&cli, ConfigMap::from_env())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        users = ?core.users,
        topic = %core.topic,
        target_dir = %core.target_dir.display(),
        dry_run = core.dry_run,
        "fleetsync starting"
    );

    let daemon = Daemon::build(config, core)?;
    daemon.init().await?;

    if cli.once {
        let outcome = daemon.run_once().await;
        daemon.stop(cli.shutdown_timeout).await;
        let report = outcome?;
        info!(converged = report.converged(), "Single cycle finished");
        return Ok(());
    }

    let served = daemon.run(wait_for_shutdown()).await;
    daemon.stop(cli.shutdown_timeout).await;
    served
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
            Err(err) => error!("Failed to listen for shutdown signal: {}", err),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
