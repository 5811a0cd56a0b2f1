//! Persistent key/value cache with optional per-entry expiry.
//!
//! This module provides a best-effort cache over a [`StorageClient`](crate::db::StorageClient):
//! - Typed values serialized as JSON, one entry per key per named store
//! - Writes fully replace the previous entry for a key
//! - Lazy expiry: expired entries are removed when read, never swept
//! - Storage failures degrade to a permanent miss and silent no-op writes

mod entry;
mod store;

pub use entry::CacheEntry;
pub use store::{PersistentCache, CACHE_STORE};
