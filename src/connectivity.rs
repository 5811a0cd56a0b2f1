//! Online/offline signal shared between the host and queries.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared connectivity flag. Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn online() -> Self {
    Self::new(true)
  }

  pub fn offline() -> Self {
    Self::new(false)
  }

  /// Update the flag. Subscribers are woken only on an actual change.
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::online()
  }
}
