//! In-process storage engine.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::engine::{StorageEngine, StoredRecord};
use crate::error::StorageError;
use crate::queue::{NewAction, PendingAction};

/// Engine that keeps everything in memory for the life of the process.
///
/// Useful for tests and for hosts without durable storage. Stores are
/// `BTreeMap`s, so scans come back in key order.
#[derive(Default)]
pub struct MemoryEngine {
  state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
  stores: HashMap<String, BTreeMap<String, StoredRecord>>,
  actions: BTreeMap<i64, PendingAction>,
  last_id: i64,
  closed: bool,
}

impl MemoryEngine {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
    let guard = self
      .state
      .lock()
      .map_err(|e| StorageError::Poisoned(e.to_string()))?;
    if guard.closed {
      return Err(StorageError::Unavailable);
    }
    Ok(guard)
  }
}

impl StorageEngine for MemoryEngine {
  fn get(&self, store: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
    let state = self.state()?;
    Ok(state.stores.get(store).and_then(|s| s.get(key)).cloned())
  }

  fn put(&self, store: &str, record: &StoredRecord) -> Result<(), StorageError> {
    let mut state = self.state()?;
    state
      .stores
      .entry(store.to_string())
      .or_default()
      .insert(record.key.clone(), record.clone());
    Ok(())
  }

  fn delete(&self, store: &str, key: &str) -> Result<(), StorageError> {
    let mut state = self.state()?;
    if let Some(s) = state.stores.get_mut(store) {
      s.remove(key);
    }
    Ok(())
  }

  fn delete_if_unchanged(&self, store: &str, record: &StoredRecord) -> Result<bool, StorageError> {
    let mut state = self.state()?;
    let Some(s) = state.stores.get_mut(store) else {
      return Ok(false);
    };
    let unchanged = s.get(&record.key).is_some_and(|current| {
      current.stored_at == record.stored_at && current.expires_at == record.expires_at
    });
    if unchanged {
      s.remove(&record.key);
    }
    Ok(unchanged)
  }

  fn scan(&self, store: &str) -> Result<Vec<StoredRecord>, StorageError> {
    let state = self.state()?;
    Ok(
      state
        .stores
        .get(store)
        .map(|s| s.values().cloned().collect())
        .unwrap_or_default(),
    )
  }

  fn clear(&self, store: &str) -> Result<(), StorageError> {
    let mut state = self.state()?;
    state.stores.remove(store);
    Ok(())
  }

  fn append_action(
    &self,
    action: &NewAction,
    enqueued_at: DateTime<Utc>,
  ) -> Result<i64, StorageError> {
    let mut state = self.state()?;
    // Ids are never reused, matching AUTOINCREMENT
    state.last_id += 1;
    let id = state.last_id;
    state.actions.insert(
      id,
      PendingAction {
        id,
        url: action.url.clone(),
        method: action.method.clone(),
        headers: action.headers.clone(),
        body: action.body.clone(),
        enqueued_at,
      },
    );
    Ok(id)
  }

  fn pending_actions(&self) -> Result<Vec<PendingAction>, StorageError> {
    let state = self.state()?;
    Ok(state.actions.values().cloned().collect())
  }

  fn delete_action(&self, id: i64) -> Result<(), StorageError> {
    let mut state = self.state()?;
    state.actions.remove(&id);
    Ok(())
  }

  fn close(&self) -> Result<(), StorageError> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| StorageError::Poisoned(e.to_string()))?;
    state.closed = true;
    state.stores.clear();
    state.actions.clear();
    Ok(())
  }
}
