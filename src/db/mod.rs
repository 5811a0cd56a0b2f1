//! Storage client: the single handle every cache, queue and draft store is built on.
//!
//! A client is constructed with an opener and does nothing until the first
//! call to [`StorageClient::open`] (or the first record operation). The open
//! runs once on a blocking task, bounded by a timeout, and its outcome is
//! cached: every caller, early or late, sees the same resolution. If the open
//! fails the client stays inert for the rest of the session and record
//! operations return [`StorageError::Unavailable`].

mod engine;
mod memory;
pub mod schema;
mod sqlite;

pub use engine::{StorageEngine, StoredRecord};
pub use memory::MemoryEngine;
pub use sqlite::SqliteEngine;

pub(crate) use engine::from_millis;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::queue::{NewAction, PendingAction};

/// Default bound on the open handshake.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

type SharedEngine = Arc<dyn StorageEngine>;
type Opener = Box<dyn FnOnce() -> Result<SharedEngine, StorageError> + Send>;
type Handshake = Shared<BoxFuture<'static, Option<SharedEngine>>>;

/// Cloneable handle to a lazily opened storage engine.
#[derive(Clone)]
pub struct StorageClient {
  inner: Arc<ClientInner>,
}

struct ClientInner {
  opener: Mutex<Option<Opener>>,
  // Spawned on first use; dropping a waiter never cancels it
  handshake: OnceLock<Handshake>,
  slot: Arc<Mutex<EngineSlot>>,
  open_timeout: Duration,
}

/// Outcome of the handshake, shared with the task that performs it.
#[derive(Default)]
struct EngineSlot {
  engine: Option<SharedEngine>,
  closed: bool,
}

impl StorageClient {
  /// Create a client around an arbitrary engine opener.
  pub fn new<E, F>(opener: F, open_timeout: Duration) -> Self
  where
    E: StorageEngine + 'static,
    F: FnOnce() -> Result<E, StorageError> + Send + 'static,
  {
    let opener: Opener = Box::new(move || opener().map(|engine| Arc::new(engine) as SharedEngine));
    Self {
      inner: Arc::new(ClientInner {
        opener: Mutex::new(Some(opener)),
        handshake: OnceLock::new(),
        slot: Arc::new(Mutex::new(EngineSlot::default())),
        open_timeout,
      }),
    }
  }

  /// Client backed by a SQLite file.
  pub fn sqlite(path: PathBuf, open_timeout: Duration) -> Self {
    Self::new(move || SqliteEngine::open(&path), open_timeout)
  }

  /// Client backed by the in-process engine.
  pub fn in_memory() -> Self {
    Self::new(|| Ok(MemoryEngine::new()), DEFAULT_OPEN_TIMEOUT)
  }

  /// Client whose open always fails. Every operation degrades to miss / no-op.
  pub fn disabled() -> Self {
    Self::new(
      || Err::<MemoryEngine, _>(StorageError::Other("storage disabled".to_string())),
      DEFAULT_OPEN_TIMEOUT,
    )
  }

  /// Build a SQLite client from configuration.
  pub fn from_config(config: &StorageConfig) -> Result<Self> {
    Ok(Self::sqlite(config.resolved_path()?, config.open_timeout()))
  }

  /// Run the open handshake (once) and report whether the store is usable.
  ///
  /// The handshake runs on its own task, so a caller that stops waiting
  /// does not affect what later callers see.
  pub async fn open(&self) -> bool {
    self.engine().await.is_some()
  }

  /// Non-blocking: true only once the handshake has succeeded and the client is not closed.
  pub fn is_ready(&self) -> bool {
    let slot = lock_slot(&self.inner.slot);
    !slot.closed && slot.engine.is_some()
  }

  /// Release the engine. The client is inert afterwards.
  ///
  /// An open still in flight closes its engine as soon as it resolves.
  pub fn close(&self) {
    let engine = {
      let mut slot = lock_slot(&self.inner.slot);
      if slot.closed {
        return;
      }
      slot.closed = true;
      slot.engine.take()
    };
    if let Some(engine) = engine {
      close_engine(engine.as_ref());
    }
  }

  async fn engine(&self) -> Option<SharedEngine> {
    if lock_slot(&self.inner.slot).closed {
      return None;
    }
    let handshake = self
      .inner
      .handshake
      .get_or_init(|| self.inner.start())
      .clone();
    handshake.await?;

    // Closed while waiting
    lock_slot(&self.inner.slot).engine.clone()
  }

  async fn ready_engine(&self) -> Result<SharedEngine, StorageError> {
    self.engine().await.ok_or(StorageError::Unavailable)
  }

  pub async fn get(&self, store: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
    self.ready_engine().await?.get(store, key)
  }

  pub async fn put(&self, store: &str, record: &StoredRecord) -> Result<(), StorageError> {
    self.ready_engine().await?.put(store, record)
  }

  pub async fn delete(&self, store: &str, key: &str) -> Result<(), StorageError> {
    self.ready_engine().await?.delete(store, key)
  }

  pub async fn delete_if_unchanged(
    &self,
    store: &str,
    record: &StoredRecord,
  ) -> Result<bool, StorageError> {
    self.ready_engine().await?.delete_if_unchanged(store, record)
  }

  pub async fn scan(&self, store: &str) -> Result<Vec<StoredRecord>, StorageError> {
    self.ready_engine().await?.scan(store)
  }

  pub async fn clear(&self, store: &str) -> Result<(), StorageError> {
    self.ready_engine().await?.clear(store)
  }

  pub async fn append_action(
    &self,
    action: &NewAction,
    enqueued_at: DateTime<Utc>,
  ) -> Result<i64, StorageError> {
    self.ready_engine().await?.append_action(action, enqueued_at)
  }

  pub async fn pending_actions(&self) -> Result<Vec<PendingAction>, StorageError> {
    self.ready_engine().await?.pending_actions()
  }

  pub async fn delete_action(&self, id: i64) -> Result<(), StorageError> {
    self.ready_engine().await?.delete_action(id)
  }
}

impl ClientInner {
  fn take_opener(&self) -> Option<Opener> {
    match self.opener.lock() {
      Ok(mut guard) => guard.take(),
      Err(_) => None,
    }
  }

  /// Spawn the handshake task and wrap it so every caller awaits the same outcome.
  fn start(&self) -> Handshake {
    let task = tokio::spawn(establish(
      self.take_opener(),
      self.open_timeout,
      Arc::clone(&self.slot),
    ));
    task
      .map(|joined| joined.ok().flatten())
      .boxed()
      .shared()
  }
}

async fn establish(
  opener: Option<Opener>,
  open_timeout: Duration,
  slot: Arc<Mutex<EngineSlot>>,
) -> Option<SharedEngine> {
  let Some(opener) = opener else {
    warn!("offline store opener unavailable");
    return None;
  };

  let task = tokio::task::spawn_blocking(opener);
  let outcome = match tokio::time::timeout(open_timeout, task).await {
    Ok(Ok(result)) => result,
    Ok(Err(join_error)) => Err(StorageError::Other(join_error.to_string())),
    Err(_) => Err(StorageError::OpenTimeout(open_timeout)),
  };

  let engine = match outcome {
    Ok(engine) => engine,
    Err(e) => {
      warn!(error = %e, "offline store unavailable; caching disabled for this session");
      return None;
    }
  };

  let mut guard = lock_slot(&slot);
  if guard.closed {
    drop(guard);
    debug!("offline store closed before it finished opening");
    close_engine(engine.as_ref());
    return None;
  }
  guard.engine = Some(Arc::clone(&engine));
  debug!("offline store ready");
  Some(engine)
}

fn lock_slot(slot: &Mutex<EngineSlot>) -> MutexGuard<'_, EngineSlot> {
  // The slot holds no invariant a panicking holder could break
  slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn close_engine(engine: &dyn StorageEngine) {
  if let Err(e) = engine.close() {
    warn!(error = %e, "failed to close offline store");
  }
}

impl std::fmt::Debug for StorageClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StorageClient")
      .field("ready", &self.is_ready())
      .field("closed", &lock_slot(&self.inner.slot).closed)
      .field("open_timeout", &self.inner.open_timeout)
      .finish_non_exhaustive()
  }
}
