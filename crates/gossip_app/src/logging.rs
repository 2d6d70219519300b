use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const DEFAULT_FILTER: &str = "info,gossip_network=debug,gossip_app=debug";
const LOG_FILE_PREFIX: &str = "gossip-demo";

/// Default log directory: `~/.gossip/logs`
pub fn logs_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".gossip").join("logs"))
}

/// Console output plus a daily-rolling file under [`logs_dir`].
/// The returned guard must be held until the process exits.
pub fn init_logging() -> Result<WorkerGuard> {
    init_logging_to_dir(&logs_dir()?, DEFAULT_FILTER)
}

/// Console output plus a daily-rolling file in `logs_dir`. `filter` applies
/// when `RUST_LOG` is not set.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(fmt::layer().with_target(false).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}
