//! Log setup. Output goes to a daily rolling file so command output on
//! stdout stays clean.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "REVSYNC_LOG";

pub fn default_log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join("revsync").join("logs"))
}

fn filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber writing to `dir/revsync.log.<date>`.
///
/// The returned guard flushes buffered lines when dropped and must be held
/// for the lifetime of the program.
pub fn init(dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, "revsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter())
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}

/// Install a subscriber writing to stderr, for when the log directory is
/// unusable.
pub fn init_stderr() -> Result<()> {
  tracing_subscriber::registry()
    .with(filter())
    .with(fmt::layer().with_writer(std::io::stderr))
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))
}
