use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::query::QueryOptions;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub storage: StorageConfig,
  pub cache: CacheConfig,
  pub query: QueryConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/offstore/offline.db)
  pub path: Option<PathBuf>,
  /// Give up on opening the store after this long and run without it
  pub open_timeout_ms: u64,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      open_timeout_ms: 5_000,
    }
  }
}

impl StorageConfig {
  pub fn open_timeout(&self) -> Duration {
    Duration::from_millis(self.open_timeout_ms)
  }

  /// The configured path, or the default location under the data directory.
  pub fn resolved_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offstore").join("offline.db"))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// TTL for cache writes that don't specify one; unset means no expiry
  pub default_ttl_secs: Option<u64>,
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Option<Duration> {
    self.default_ttl_secs.map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  /// TTL written with fresh query results
  pub ttl_secs: Option<u64>,
  pub stale_while_revalidate: bool,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      ttl_secs: None,
      stale_while_revalidate: true,
    }
  }
}

impl QueryConfig {
  pub fn options(&self) -> QueryOptions {
    QueryOptions {
      ttl: self.ttl_secs.map(Duration::from_secs),
      stale_while_revalidate: self.stale_while_revalidate,
      ..QueryOptions::default()
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// `EnvFilter` directives; `RUST_LOG` takes precedence
  pub filter: String,
  /// Write logs to this file (rotated daily) instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      filter: "warn".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offstore.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offstore/config.yaml
  ///
  /// With no file found, defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offstore.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offstore").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file deserializes to unit, not a mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }
}
