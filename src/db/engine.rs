//! Storage engine trait and the record types it persists.

use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::queue::{NewAction, PendingAction};

/// A raw keyed record as held by an engine.
///
/// `data` is the serialized payload; timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
  pub key: String,
  pub data: Vec<u8>,
  pub stored_at: i64,
  pub expires_at: Option<i64>,
}

/// Trait for durable key/value backends.
///
/// Engines group keyed records into named stores and keep a separate
/// append-only queue whose ids are assigned by the engine. Each single
/// operation must be atomic; nothing spans more than one key.
pub trait StorageEngine: Send + Sync {
  /// Look up a record by key within a store.
  fn get(&self, store: &str, key: &str) -> Result<Option<StoredRecord>, StorageError>;

  /// Insert or fully replace the record for `record.key`.
  fn put(&self, store: &str, record: &StoredRecord) -> Result<(), StorageError>;

  /// Delete a record. Missing keys are not an error.
  fn delete(&self, store: &str, key: &str) -> Result<(), StorageError>;

  /// Delete the record for `record.key` only if it still carries the same
  /// `stored_at` and `expires_at`. Returns whether a record was removed.
  fn delete_if_unchanged(&self, store: &str, record: &StoredRecord) -> Result<bool, StorageError>;

  /// Every record in a store, in engine order.
  fn scan(&self, store: &str) -> Result<Vec<StoredRecord>, StorageError>;

  /// Remove every record in a store.
  fn clear(&self, store: &str) -> Result<(), StorageError>;

  /// Append an action to the queue and return its assigned id.
  fn append_action(
    &self,
    action: &NewAction,
    enqueued_at: DateTime<Utc>,
  ) -> Result<i64, StorageError>;

  /// All queued actions in ascending id order.
  fn pending_actions(&self) -> Result<Vec<PendingAction>, StorageError>;

  /// Delete a queued action by id. Missing ids are not an error.
  fn delete_action(&self, id: i64) -> Result<(), StorageError>;

  /// Release the underlying resources. Later calls fail with `Unavailable`.
  fn close(&self) -> Result<(), StorageError>;
}

/// Convert epoch milliseconds back into a UTC timestamp.
pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
  DateTime::from_timestamp_millis(ms)
    .ok_or_else(|| StorageError::Other(format!("timestamp out of range: {}", ms)))
}
