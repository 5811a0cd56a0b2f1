//! Form drafts: at most one saved draft per form id.
//!
//! Drafts live in their own store so their keys never collide with the
//! generic cache, and they never expire on their own.

use serde::{de::DeserializeOwned, Serialize};

use crate::cache::PersistentCache;
use crate::db::StorageClient;

/// Store holding form drafts.
pub const DRAFTS_STORE: &str = "form_drafts";

#[derive(Debug, Clone)]
pub struct FormDraftStore {
  cache: PersistentCache,
}

impl FormDraftStore {
  pub fn new(client: StorageClient) -> Self {
    Self {
      cache: PersistentCache::with_store(client, DRAFTS_STORE),
    }
  }

  /// Overwrite the draft for `form_id`.
  pub async fn save_draft<T: Serialize>(&self, form_id: &str, data: &T) {
    self.cache.set_item(form_id, data, None).await;
  }

  pub async fn load_draft<T: DeserializeOwned>(&self, form_id: &str) -> Option<T> {
    self.cache.get_item(form_id).await
  }

  /// Drop the draft, typically after a successful submit.
  pub async fn clear_draft(&self, form_id: &str) {
    self.cache.delete_item(form_id).await;
  }

  /// Every saved draft's form id, for "resume where you left off" listings.
  pub async fn form_ids(&self) -> Vec<String> {
    self
      .cache
      .get_all_entries::<serde_json::Value>()
      .await
      .into_iter()
      .map(|entry| entry.key)
      .collect()
  }

  /// Bind a draft view to one form. Call [`FormDraft::load`] before reading it.
  pub fn mount<T>(&self, form_id: impl Into<String>) -> FormDraft<T> {
    FormDraft {
      store: self.clone(),
      form_id: form_id.into(),
      draft: None,
      is_loading: true,
    }
  }
}

/// The draft state of one mounted form.
#[derive(Debug)]
pub struct FormDraft<T> {
  store: FormDraftStore,
  form_id: String,
  draft: Option<T>,
  is_loading: bool,
}

impl<T: Serialize + DeserializeOwned> FormDraft<T> {
  pub fn form_id(&self) -> &str {
    &self.form_id
  }

  pub fn draft(&self) -> Option<&T> {
    self.draft.as_ref()
  }

  /// True until the initial read has resolved.
  pub fn is_loading(&self) -> bool {
    self.is_loading
  }

  /// Perform the initial read.
  ///
  /// Waits for the storage handshake; if storage never becomes usable this
  /// resolves with no draft instead of waiting forever.
  pub async fn load(&mut self) -> Option<&T> {
    self.draft = self.store.load_draft(&self.form_id).await;
    self.is_loading = false;
    self.draft.as_ref()
  }

  pub async fn save(&mut self, data: T) {
    self.store.save_draft(&self.form_id, &data).await;
    self.draft = Some(data);
  }

  pub async fn clear(&mut self) {
    self.store.clear_draft(&self.form_id).await;
    self.draft = None;
  }
}
