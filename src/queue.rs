//! Durable FIFO queue of write intents that could not be sent.
//!
//! The queue only stores and orders actions. Replaying them is left to a
//! host-side synchronization routine, which deletes each action by id once
//! it has been delivered.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::db::StorageClient;
use crate::error::{QueueError, StorageError};

/// Tag passed to the background-sync collaborator after each enqueue.
pub const SYNC_TAG: &str = "sync-pending-actions";

/// A request that could not be sent yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAction {
  pub url: String,
  pub method: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
}

impl NewAction {
  pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: method.into(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }
}

/// A queued action as stored. Never modified after it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
  /// Engine-assigned, increasing in insertion order
  pub id: i64,
  pub url: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
  pub enqueued_at: DateTime<Utc>,
}

/// Host facility told that there is queued work (e.g. a background-sync registration).
///
/// Notification is fire-and-forget; a failure never affects the enqueue.
pub trait SyncNotifier: Send + Sync {
  fn notify(&self, tag: &str) -> Result<()>;
}

/// A background-sync request forwarded by [`ChannelNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
  pub tag: String,
}

/// Notifier that forwards requests to whoever holds the receiving end.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  tx: mpsc::UnboundedSender<SyncRequest>,
}

impl ChannelNotifier {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl SyncNotifier for ChannelNotifier {
  fn notify(&self, tag: &str) -> Result<()> {
    self
      .tx
      .send(SyncRequest {
        tag: tag.to_string(),
      })
      .map_err(|_| eyre!("background sync receiver has been dropped"))
  }
}

/// The mutation queue.
#[derive(Clone)]
pub struct MutationQueue {
  client: StorageClient,
  notifier: Option<Arc<dyn SyncNotifier>>,
}

impl MutationQueue {
  pub fn new(client: StorageClient) -> Self {
    Self {
      client,
      notifier: None,
    }
  }

  /// Notify `notifier` after every successful enqueue.
  pub fn with_notifier(mut self, notifier: Arc<dyn SyncNotifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }

  /// Append an action and return its id.
  ///
  /// If the store is not ready the action is lost; this is reported as
  /// [`QueueError::StorageUnavailable`] and logged, never swallowed.
  pub async fn queue_action(&self, action: NewAction) -> Result<i64, QueueError> {
    match self.client.append_action(&action, Utc::now()).await {
      Ok(id) => {
        debug!(id, method = %action.method, url = %action.url, "queued pending action");
        self.notify_sync();
        Ok(id)
      }
      Err(StorageError::Unavailable) => {
        error!(
          method = %action.method,
          url = %action.url,
          "offline store unavailable; pending action dropped"
        );
        Err(QueueError::StorageUnavailable)
      }
      Err(e) => {
        error!(
          method = %action.method,
          url = %action.url,
          error = %e,
          "failed to queue pending action"
        );
        Err(QueueError::Storage(e))
      }
    }
  }

  /// All queued actions, oldest first. Nothing is dequeued.
  pub async fn get_pending_actions(&self) -> Vec<PendingAction> {
    match self.client.pending_actions().await {
      Ok(actions) => actions,
      Err(StorageError::Unavailable) => Vec::new(),
      Err(e) => {
        warn!(error = %e, "failed to read pending actions");
        Vec::new()
      }
    }
  }

  /// Delete a replayed action. Unknown ids are ignored.
  pub async fn remove_action(&self, id: i64) {
    match self.client.delete_action(id).await {
      Ok(()) | Err(StorageError::Unavailable) => {}
      Err(e) => warn!(id, error = %e, "failed to remove pending action"),
    }
  }

  fn notify_sync(&self) {
    if let Some(notifier) = &self.notifier {
      if let Err(e) = notifier.notify(SYNC_TAG) {
        debug!(error = %e, "background sync notification failed");
      }
    }
  }
}
