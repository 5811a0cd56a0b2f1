//! Cache operations over a named store.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use crate::db::{StorageClient, StoredRecord};
use crate::error::StorageError;

/// Store used by the generic cache.
pub const CACHE_STORE: &str = "cache";

/// Persistent cache bound to one named store.
///
/// Every operation is best-effort. When the storage client is not usable,
/// reads miss and writes are dropped; callers never see a storage error.
#[derive(Debug, Clone)]
pub struct PersistentCache {
  client: StorageClient,
  store: String,
  default_ttl: Option<Duration>,
}

impl PersistentCache {
  /// Cache over the generic `cache` store.
  pub fn new(client: StorageClient) -> Self {
    Self::with_store(client, CACHE_STORE)
  }

  /// Cache over any named store. Keys never collide across stores.
  pub fn with_store(client: StorageClient, store: impl Into<String>) -> Self {
    Self {
      client,
      store: store.into(),
      default_ttl: None,
    }
  }

  /// TTL applied by [`set_item_default`](Self::set_item_default).
  pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn store(&self) -> &str {
    &self.store
  }

  pub fn client(&self) -> &StorageClient {
    &self.client
  }

  /// Wait for the open handshake and report whether the cache is usable.
  pub async fn is_ready(&self) -> bool {
    self.client.open().await
  }

  /// Look up an entry, deleting it if it has expired.
  pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    let record = match self.client.get(&self.store, key).await {
      Ok(Some(record)) => record,
      Ok(None) => {
        debug!(store = %self.store, key, "cache miss");
        return None;
      }
      Err(e) => {
        self.log_failure("read", key, &e);
        return None;
      }
    };

    // Enough of the record to evict exactly this version later
    let version = StoredRecord {
      key: record.key.clone(),
      data: Vec::new(),
      stored_at: record.stored_at,
      expires_at: record.expires_at,
    };

    let entry = match CacheEntry::<T>::decode(record) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(store = %self.store, key, error = %e, "undecodable cache entry treated as miss");
        return None;
      }
    };

    if entry.is_expired_at(Utc::now()) {
      debug!(store = %self.store, key, "cache entry expired");
      self.evict(&version).await;
      return None;
    }

    debug!(store = %self.store, key, "cache hit");
    Some(entry)
  }

  /// Cached value for `key`, or `None` on miss or expiry.
  pub async fn get_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.get_entry(key).await.map(|entry| entry.data)
  }

  /// Overwrite the entry for `key`. With no TTL the entry never expires.
  pub async fn set_item<T: Serialize>(&self, key: &str, data: &T, ttl: Option<Duration>) {
    let record = match CacheEntry::encode(key, data, ttl, Utc::now()) {
      Ok(record) => record,
      Err(e) => {
        warn!(store = %self.store, key, error = %e, "failed to serialize cache entry");
        return;
      }
    };

    if let Err(e) = self.client.put(&self.store, &record).await {
      self.log_failure("write", key, &e);
    }
  }

  /// Overwrite the entry for `key` using the configured default TTL.
  pub async fn set_item_default<T: Serialize>(&self, key: &str, data: &T) {
    self.set_item(key, data, self.default_ttl).await;
  }

  /// Remove the entry for `key`. Missing keys are fine.
  pub async fn delete_item(&self, key: &str) {
    if let Err(e) = self.client.delete(&self.store, key).await {
      self.log_failure("delete", key, &e);
    }
  }

  /// Every unexpired entry in the store, in storage order.
  ///
  /// Expired entries are skipped but left in place.
  pub async fn get_all_entries<T: DeserializeOwned>(&self) -> Vec<CacheEntry<T>> {
    let records = match self.client.scan(&self.store).await {
      Ok(records) => records,
      Err(e) => {
        self.log_failure("scan", "*", &e);
        return Vec::new();
      }
    };

    let now = Utc::now();
    records
      .into_iter()
      .filter_map(|record| {
        let key = record.key.clone();
        match CacheEntry::<T>::decode(record) {
          Ok(entry) => Some(entry),
          Err(e) => {
            warn!(store = %self.store, key = %key, error = %e, "skipping undecodable cache entry");
            None
          }
        }
      })
      .filter(|entry| !entry.is_expired_at(now))
      .collect()
  }

  /// Payloads of every unexpired entry.
  pub async fn get_all_items<T: DeserializeOwned>(&self) -> Vec<T> {
    self
      .get_all_entries()
      .await
      .into_iter()
      .map(|entry| entry.data)
      .collect()
  }

  /// Remove every entry in this store.
  pub async fn clear_store(&self) {
    if let Err(e) = self.client.clear(&self.store).await {
      self.log_failure("clear", "*", &e);
    }
  }

  /// Delete an expired record unless another writer has replaced it since it was read.
  async fn evict(&self, version: &StoredRecord) {
    match self.client.delete_if_unchanged(&self.store, version).await {
      Ok(true) => {}
      Ok(false) => debug!(store = %self.store, key = %version.key, "expired entry already replaced"),
      Err(e) => self.log_failure("evict", &version.key, &e),
    }
  }

  fn log_failure(&self, op: &str, key: &str, error: &StorageError) {
    match error {
      // Already reported once by the client
      StorageError::Unavailable => {}
      e => warn!(store = %self.store, op, key, error = %e, "cache operation failed"),
    }
  }
}
