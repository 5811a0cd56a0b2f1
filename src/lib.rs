//! Offline resilience for data-driven clients.
//!
//! - [`cache`]: persistent key/value cache with lazy expiry
//! - [`drafts`]: one saved draft per form
//! - [`queue`]: durable FIFO of write intents awaiting replay
//! - [`query`]: stale-while-revalidate reads over the cache
//!
//! Everything is built on a [`db::StorageClient`], constructed once and
//! passed to each component. Storage is best-effort: if it cannot be
//! opened, reads miss and writes are dropped, and the rest keeps working.
//!
//! Concurrent writers to the same store (several processes on one file)
//! resolve as last-write-wins per key, by completion order. There are no
//! per-key versions.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod drafts;
pub mod error;
pub mod logging;
pub mod query;
pub mod queue;

pub use cache::{CacheEntry, PersistentCache};
pub use connectivity::Connectivity;
pub use db::StorageClient;
pub use drafts::{FormDraft, FormDraftStore};
pub use error::{QueryError, QueueError, StorageError};
pub use query::{OfflineQuery, QueryOptions, QuerySnapshot};
pub use queue::{MutationQueue, NewAction, PendingAction};
