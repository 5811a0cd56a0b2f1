//! Typed cache entries.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::db::{from_millis, StoredRecord};
use crate::error::StorageError;

/// A decoded cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub key: String,
  pub data: T,
  /// When the entry was last written
  pub stored_at: DateTime<Utc>,
  /// After this instant the entry counts as deleted
  pub expires_at: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
  /// Whether the entry has expired as of `now`.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|expires_at| now > expires_at)
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }
}

impl<T: Serialize> CacheEntry<T> {
  /// Encode a payload into a freshly stamped record.
  pub(crate) fn encode(
    key: &str,
    data: &T,
    ttl: Option<Duration>,
    now: DateTime<Utc>,
  ) -> Result<StoredRecord, StorageError> {
    let stored_at = now.timestamp_millis();
    let expires_at = ttl.map(|ttl| {
      let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
      stored_at.saturating_add(ttl_ms)
    });

    Ok(StoredRecord {
      key: key.to_string(),
      data: serde_json::to_vec(data)?,
      stored_at,
      expires_at,
    })
  }
}

impl<T: DeserializeOwned> CacheEntry<T> {
  pub(crate) fn decode(record: StoredRecord) -> Result<Self, StorageError> {
    Ok(Self {
      data: serde_json::from_slice(&record.data)?,
      stored_at: from_millis(record.stored_at)?,
      // Beyond the representable range means it never expires
      expires_at: record.expires_at.and_then(DateTime::from_timestamp_millis),
      key: record.key,
    })
  }
}
