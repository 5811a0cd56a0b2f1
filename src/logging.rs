//! Tracing subscriber setup for the binary.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install the global subscriber.
///
/// Logs go to stderr unless `log.file` is set, in which case they are
/// written to a daily-rotated file. Keep the returned guard alive until
/// exit so buffered lines are flushed.
pub fn install(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = match EnvFilter::try_from_default_env() {
    Ok(filter) => filter,
    Err(_) => EnvFilter::try_new(&config.filter)
      .map_err(|e| eyre!("Invalid log filter '{}': {}", config.filter, e))?,
  };

  match &config.file {
    Some(path) => {
      let (directory, file_name) = split_log_path(path)?;
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

      let appender = tracing_appender::rolling::daily(directory, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;

      Ok(None)
    }
  }
}

fn split_log_path(path: &Path) -> Result<(&Path, &Path)> {
  let file_name = path
    .file_name()
    .map(Path::new)
    .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
  let directory = match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent,
    _ => Path::new("."),
  };
  Ok((directory, file_name))
}
