//! Error types for the storage client, mutation queue and offline queries.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a storage engine or the client that owns it.
#[derive(Error, Debug)]
pub enum StorageError {
  /// The store never opened, was closed, or failed its open handshake.
  #[error("storage is not available")]
  Unavailable,

  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Lock poisoned: {0}")]
  Poisoned(String),

  #[error("storage did not open within {0:?}")]
  OpenTimeout(Duration),

  #[error("database schema version {found} is newer than supported version {supported}")]
  SchemaVersion { found: i64, supported: i64 },

  #[error("{0}")]
  Other(String),
}

/// Errors surfaced when a write intent cannot be queued.
#[derive(Error, Debug)]
pub enum QueueError {
  /// The store is not ready, so the action was dropped.
  #[error("storage unavailable: pending action was not queued")]
  StorageUnavailable,

  #[error("failed to queue pending action: {0}")]
  Storage(#[source] StorageError),
}

/// Errors reported by an offline query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  /// Offline with nothing cached for the key.
  #[error("no cached data available")]
  NoDataAvailable,

  /// The fetch function failed and no cached value could stand in for it.
  #[error("{0}")]
  FetchFailed(String),

  /// The background fetch ended without reporting a result.
  #[error("query was cancelled")]
  Cancelled,
}

impl QueryError {
  /// Whether the error means "no connection" rather than a server or network failure.
  pub fn is_offline(&self) -> bool {
    matches!(self, QueryError::NoDataAvailable)
  }
}
