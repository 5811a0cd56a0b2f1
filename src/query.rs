//! Stale-while-revalidate queries over the persistent cache.
//!
//! Inspired by TanStack Query, an `OfflineQuery<T>` serves whatever the cache
//! holds for its key straight away, then refreshes it from the network when
//! connectivity allows.
//!
//! # Example
//!
//! ```ignore
//! let api = api_client.clone();
//! let mut query = OfflineQuery::new("customers", cache, connectivity, move || {
//!     let api = api.clone();
//!     async move { api.list_customers().await.map_err(|e| e.to_string()) }
//! });
//!
//! // Start fetching in the background
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match (query.data(), query.error()) {
//!     (Some(data), _) if query.is_stale() => render_stale(data),
//!     (Some(data), _) => render_data(data),
//!     (None, Some(e)) if e.is_offline() => render_no_connection(),
//!     (None, Some(e)) => render_error(e),
//!     (None, None) => render_spinner(),
//! }
//! ```

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::PersistentCache;
use crate::connectivity::Connectivity;
use crate::error::QueryError;

/// Per-query behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
  /// TTL written with fresh results; `None` means they never expire
  pub ttl: Option<Duration>,
  /// Still try the network while offline if a cached value was served
  pub stale_while_revalidate: bool,
  /// A disabled query stays idle
  pub enabled: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      ttl: None,
      stale_while_revalidate: true,
      enabled: true,
    }
  }
}

/// What a query currently shows.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<T> {
  pub data: Option<T>,
  /// Data came from the cache and has not been confirmed by a fetch
  pub is_stale: bool,
  pub is_loading: bool,
  pub error: Option<QueryError>,
}

impl<T> Default for QuerySnapshot<T> {
  fn default() -> Self {
    Self {
      data: None,
      is_stale: false,
      is_loading: false,
      error: None,
    }
  }
}

/// Progress reported by one revalidation.
#[derive(Debug)]
enum QueryUpdate<T> {
  /// Cached value served before the fetch
  Stale(T),
  /// Cache re-read after a failed fetch
  Reread(T),
  /// Fetch succeeded and was written to the cache
  Fresh(T),
  Failed(QueryError),
  /// Finished without a fresh result
  Settled,
}

impl<T> QueryUpdate<T> {
  fn is_terminal(&self) -> bool {
    matches!(
      self,
      QueryUpdate::Fresh(_) | QueryUpdate::Failed(_) | QueryUpdate::Settled
    )
  }
}

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, String>> + Send + Sync>;

/// Stale-while-revalidate query for one cache key.
///
/// Each query owns at most one in-flight revalidation, so results never
/// arrive out of order. `run()` drives a revalidation inline; `fetch()`
/// spawns it and `poll()` collects its progress.
pub struct OfflineQuery<T> {
  key: String,
  cache: PersistentCache,
  connectivity: Connectivity,
  connectivity_rx: watch::Receiver<bool>,
  fetcher: FetcherFn<T>,
  options: QueryOptions,
  snapshot: QuerySnapshot<T>,
  receiver: Option<mpsc::UnboundedReceiver<QueryUpdate<T>>>,
  task: Option<JoinHandle<()>>,
}

impl<T> OfflineQuery<T>
where
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
  /// Create a query for `key` with the given fetcher.
  ///
  /// The fetcher is called once per revalidation. Its error message is
  /// passed through to callers when no cached value can stand in.
  pub fn new<F, Fut>(
    key: impl Into<String>,
    cache: PersistentCache,
    connectivity: Connectivity,
    fetcher: F,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    let connectivity_rx = connectivity.subscribe();
    Self {
      key: key.into(),
      cache,
      connectivity,
      connectivity_rx,
      fetcher: Arc::new(move || fetcher().boxed()),
      options: QueryOptions::default(),
      snapshot: QuerySnapshot::default(),
      receiver: None,
      task: None,
    }
  }

  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn snapshot(&self) -> &QuerySnapshot<T> {
    &self.snapshot
  }

  pub fn data(&self) -> Option<&T> {
    self.snapshot.data.as_ref()
  }

  pub fn is_stale(&self) -> bool {
    self.snapshot.is_stale
  }

  pub fn is_loading(&self) -> bool {
    self.snapshot.is_loading
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.snapshot.error.as_ref()
  }

  /// Run one revalidation to completion and return the resulting snapshot.
  ///
  /// Any background revalidation started by `fetch()` is abandoned.
  pub async fn run(&mut self) -> &QuerySnapshot<T> {
    self.cancel();
    if !self.options.enabled {
      return &self.snapshot;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let job = self.begin(tx);
    job.await;

    while let Ok(update) = rx.try_recv() {
      self.apply(update);
    }
    &self.snapshot
  }

  /// Start a background revalidation if one is not already running.
  pub fn fetch(&mut self) {
    if self.snapshot.is_loading {
      return;
    }
    self.start_fetch();
  }

  /// Abandon any pending revalidation and start a new one.
  pub fn refetch(&mut self) {
    self.cancel();
    self.start_fetch();
  }

  /// Collect progress from a background revalidation.
  ///
  /// Also re-runs the query when connectivity comes back. Returns `true`
  /// if the snapshot changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    if self.connectivity_rx.has_changed().unwrap_or(false) {
      let online = *self.connectivity_rx.borrow_and_update();
      if online && self.options.enabled {
        debug!(key = %self.key, "connectivity restored; revalidating");
        self.refetch();
        changed = true;
      }
    }

    let Some(mut receiver) = self.receiver.take() else {
      return changed;
    };

    loop {
      match receiver.try_recv() {
        Ok(update) => {
          let done = update.is_terminal();
          self.apply(update);
          changed = true;
          if done {
            return changed;
          }
        }
        Err(mpsc::error::TryRecvError::Empty) => {
          self.receiver = Some(receiver);
          return changed;
        }
        Err(mpsc::error::TryRecvError::Disconnected) => {
          // Sender dropped without a terminal update
          self.snapshot.is_loading = false;
          self.snapshot.error = Some(QueryError::Cancelled);
          return true;
        }
      }
    }
  }

  fn start_fetch(&mut self) {
    if !self.options.enabled {
      return;
    }
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.task = Some(tokio::spawn(self.begin(tx)));
  }

  /// Stop the background revalidation, if any, before it can write to the cache.
  fn cancel(&mut self) {
    self.receiver = None;
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }

  /// Reset per-run state and build the revalidation future.
  fn begin(
    &mut self,
    tx: mpsc::UnboundedSender<QueryUpdate<T>>,
  ) -> impl Future<Output = ()> + Send + 'static {
    self.snapshot.is_loading = true;
    self.snapshot.error = None;
    self.connectivity_rx.borrow_and_update();

    revalidate(
      self.key.clone(),
      self.cache.clone(),
      self.connectivity.is_online(),
      self.options.clone(),
      Arc::clone(&self.fetcher),
      tx,
    )
  }

  fn apply(&mut self, update: QueryUpdate<T>) {
    match update {
      QueryUpdate::Stale(data) => {
        self.snapshot.data = Some(data);
        self.snapshot.is_stale = true;
      }
      QueryUpdate::Reread(data) => {
        self.snapshot.data = Some(data);
      }
      QueryUpdate::Fresh(data) => {
        self.snapshot.data = Some(data);
        self.snapshot.is_stale = false;
        self.snapshot.error = None;
        self.snapshot.is_loading = false;
      }
      QueryUpdate::Failed(error) => {
        self.snapshot.error = Some(error);
        self.snapshot.is_loading = false;
      }
      QueryUpdate::Settled => {
        self.snapshot.is_loading = false;
      }
    }
  }
}

/// One pass of cache check, optional fetch and cache write.
async fn revalidate<T>(
  key: String,
  cache: PersistentCache,
  online: bool,
  options: QueryOptions,
  fetcher: FetcherFn<T>,
  tx: mpsc::UnboundedSender<QueryUpdate<T>>,
) where
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
  // Ignore send errors - receiver may have been dropped
  let served = match cache.get_item::<T>(&key).await {
    Some(data) => {
      let _ = tx.send(QueryUpdate::Stale(data));
      true
    }
    None => false,
  };

  if !online {
    if !served {
      debug!(key = %key, "offline with nothing cached");
      let _ = tx.send(QueryUpdate::Failed(QueryError::NoDataAvailable));
      return;
    }
    if !options.stale_while_revalidate {
      let _ = tx.send(QueryUpdate::Settled);
      return;
    }
  }

  match fetcher().await {
    Ok(data) => {
      cache.set_item(&key, &data, options.ttl).await;
      let _ = tx.send(QueryUpdate::Fresh(data));
    }
    Err(message) if !served => {
      let _ = tx.send(QueryUpdate::Failed(QueryError::FetchFailed(message)));
    }
    Err(message) => {
      warn!(key = %key, error = %message, "fetch failed; serving cached data");
      // Another writer may have refreshed the entry meanwhile
      if let Some(data) = cache.get_item::<T>(&key).await {
        let _ = tx.send(QueryUpdate::Reread(data));
      }
      let _ = tx.send(QueryUpdate::Settled);
    }
  }
}

// OfflineQuery is not Clone because the receiver is owned.

impl<T> Drop for OfflineQuery<T> {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OfflineQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OfflineQuery")
      .field("key", &self.key)
      .field("options", &self.options)
      .field("snapshot", &self.snapshot)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::StorageClient;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn cache() -> PersistentCache {
    PersistentCache::new(StorageClient::in_memory())
  }

  fn counting_fetcher<T: Clone + Send + Sync + 'static>(
    result: Result<T, String>,
  ) -> (
    Arc<AtomicU32>,
    impl Fn() -> std::future::Ready<Result<T, String>> + Send + Sync + 'static,
  ) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    (calls, move || {
      counter.fetch_add(1, Ordering::SeqCst);
      std::future::ready(result.clone())
    })
  }

  #[tokio::test]
  async fn test_failed_fetch_serves_stale_cache() {
    let cache = cache();
    cache.set_item("orders", &vec![1, 2], None).await;

    let mut query = OfflineQuery::new("orders", cache, Connectivity::online(), || async {
      Err::<Vec<i32>, _>("network unreachable".to_string())
    });
    let snapshot = query.run().await;

    assert_eq!(snapshot.data, Some(vec![1, 2]));
    assert!(snapshot.is_stale);
    assert!(snapshot.error.is_none());
    assert!(!snapshot.is_loading);
  }

  #[tokio::test]
  async fn test_online_refresh_replaces_stale_and_writes_cache() {
    let cache = cache();
    cache.set_item("orders", &vec![1], None).await;

    let mut query = OfflineQuery::new("orders", cache.clone(), Connectivity::online(), || async {
      Ok::<_, String>(vec![1, 2, 3])
    });
    let snapshot = query.run().await;

    assert_eq!(snapshot.data, Some(vec![1, 2, 3]));
    assert!(!snapshot.is_stale);
    assert_eq!(cache.get_item::<Vec<i32>>("orders").await, Some(vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_offline_without_cache_reports_no_data() {
    let (calls, fetcher) = counting_fetcher::<i32>(Err("offline".to_string()));
    let mut query = OfflineQuery::new("kpis", cache(), Connectivity::offline(), fetcher);

    let snapshot = query.run().await;

    assert_eq!(snapshot.data, None);
    assert_eq!(snapshot.error, Some(QueryError::NoDataAvailable));
    assert!(snapshot.error.as_ref().unwrap().is_offline());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_online_fetch_failure_without_cache_passes_error_through() {
    let mut query = OfflineQuery::new("kpis", cache(), Connectivity::online(), || async {
      Err::<i32, _>("500 Internal Server Error".to_string())
    });

    let snapshot = query.run().await;

    assert_eq!(snapshot.data, None);
    assert_eq!(
      snapshot.error,
      Some(QueryError::FetchFailed("500 Internal Server Error".to_string()))
    );
  }

  #[tokio::test]
  async fn test_offline_with_cache_skips_network_without_swr() {
    let cache = cache();
    cache.set_item("k", &"cached", None).await;
    let (calls, fetcher) = counting_fetcher(Ok("fresh".to_string()));

    let mut query = OfflineQuery::new("k", cache, Connectivity::offline(), fetcher).with_options(
      QueryOptions {
        stale_while_revalidate: false,
        ..QueryOptions::default()
      },
    );
    let snapshot = query.run().await;

    assert_eq!(snapshot.data.as_deref(), Some("cached"));
    assert!(snapshot.is_stale);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_offline_with_cache_still_revalidates_with_swr() {
    let cache = cache();
    cache.set_item("k", &"cached", None).await;
    let (calls, fetcher) = counting_fetcher(Ok("fresh".to_string()));

    let mut query = OfflineQuery::new("k", cache, Connectivity::offline(), fetcher);
    let snapshot = query.run().await;

    assert_eq!(snapshot.data.as_deref(), Some("fresh"));
    assert!(!snapshot.is_stale);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fresh_result_written_with_ttl() {
    let cache = cache();
    let mut query = OfflineQuery::new("k", cache.clone(), Connectivity::online(), || async {
      Ok::<_, String>(7)
    })
    .with_options(QueryOptions {
      ttl: Some(Duration::from_millis(20)),
      ..QueryOptions::default()
    });

    query.run().await;
    assert_eq!(cache.get_item::<i32>("k").await, Some(7));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.get_item::<i32>("k").await, None);
  }

  #[tokio::test]
  async fn test_failed_fetch_rereads_cache() {
    let cache = cache();
    cache.set_item("k", &1, None).await;

    // Simulate another writer refreshing the entry while the fetch is in flight
    let writer = cache.clone();
    let mut query = OfflineQuery::new("k", cache, Connectivity::online(), move || {
      let writer = writer.clone();
      async move {
        writer.set_item("k", &2, None).await;
        Err::<i32, _>("timeout".to_string())
      }
    });
    let snapshot = query.run().await;

    assert_eq!(snapshot.data, Some(2));
    assert!(snapshot.is_stale);
    assert!(snapshot.error.is_none());
  }

  #[tokio::test]
  async fn test_disabled_query_stays_idle() {
    let (calls, fetcher) = counting_fetcher(Ok(1));
    let mut query = OfflineQuery::new("k", cache(), Connectivity::online(), fetcher).with_options(
      QueryOptions {
        enabled: false,
        ..QueryOptions::default()
      },
    );

    let snapshot = query.run().await;
    assert_eq!(snapshot, &QuerySnapshot::default());

    query.fetch();
    assert!(!query.is_loading());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_storage_unavailable_falls_back_to_network() {
    let cache = PersistentCache::new(StorageClient::disabled());
    let mut query = OfflineQuery::new("k", cache, Connectivity::online(), || async {
      Ok::<_, String>("from network".to_string())
    });

    let snapshot = query.run().await;

    assert_eq!(snapshot.data.as_deref(), Some("from network"));
    assert!(!snapshot.is_stale);
  }

  #[tokio::test]
  async fn test_background_fetch_and_poll() {
    let cache = cache();
    cache.set_item("k", &"stale", None).await;

    let mut query = OfflineQuery::new("k", cache.clone(), Connectivity::online(), || async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      Ok::<_, String>("fresh".to_string())
    });

    query.fetch();
    assert!(query.is_loading());

    // Second fetch should be no-op
    query.fetch();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(query.poll());
    assert_eq!(query.data().map(String::as_str), Some("fresh"));
    assert!(!query.is_stale());
    assert!(!query.is_loading());
    assert_eq!(cache.get_item::<String>("k").await.as_deref(), Some("fresh"));

    // Nothing further to report
    assert!(!query.poll());
  }

  #[tokio::test]
  async fn test_refetch_cancels_pending() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let mut query = OfflineQuery::new("k", cache(), Connectivity::online(), move || {
      let counter = counter_clone.clone();
      async move {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, String>(n)
      }
    });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Refetch should cancel the first and start a new one
    query.refetch();
    tokio::time::sleep(Duration::from_millis(150)).await;

    query.poll();
    // Only the second fetch should have been received
    assert_eq!(query.data(), Some(&1));
  }

  #[tokio::test]
  async fn test_refetch_keeps_slower_earlier_fetch_out_of_cache() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let mut query = OfflineQuery::new("k", cache.clone(), Connectivity::online(), move || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        // The first fetch is the slow one
        let delay = if n == 0 { 100 } else { 10 };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok::<_, String>(n)
      }
    });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(5)).await;
    query.refetch();
    tokio::time::sleep(Duration::from_millis(200)).await;
    query.poll();

    assert_eq!(query.data(), Some(&1));
    assert_eq!(cache.get_item::<u32>("k").await, Some(1));
  }

  #[tokio::test]
  async fn test_run_cancels_background_fetch() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let mut query = OfflineQuery::new("k", cache.clone(), Connectivity::online(), move || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok::<_, String>(n)
      }
    });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(query.run().await.data, Some(1));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(cache.get_item::<u32>("k").await, Some(1));
  }

  #[tokio::test]
  async fn test_reconnect_triggers_revalidation() {
    let cache = cache();
    cache.set_item("k", &"cached", None).await;
    let connectivity = Connectivity::offline();
    let (calls, fetcher) = counting_fetcher(Ok("fresh".to_string()));

    let mut query = OfflineQuery::new("k", cache, connectivity.clone(), fetcher).with_options(
      QueryOptions {
        stale_while_revalidate: false,
        ..QueryOptions::default()
      },
    );
    query.run().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    connectivity.set_online(true);
    assert!(query.poll());
    tokio::time::sleep(Duration::from_millis(50)).await;
    query.poll();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(query.data().map(String::as_str), Some("fresh"));
    assert!(!query.is_stale());
  }

  #[tokio::test]
  async fn test_going_offline_does_not_revalidate() {
    let connectivity = Connectivity::online();
    let (calls, fetcher) = counting_fetcher(Ok(1));
    let mut query = OfflineQuery::new("k", cache(), connectivity.clone(), fetcher);
    query.run().await;

    connectivity.set_online(false);
    assert!(!query.poll());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
