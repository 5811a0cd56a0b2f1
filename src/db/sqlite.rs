//! SQLite storage engine.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use super::engine::{from_millis, StorageEngine, StoredRecord};
use super::schema::{SCHEMA_V1, SCHEMA_VERSION};
use crate::error::StorageError;
use crate::queue::{NewAction, PendingAction};

/// How long a statement waits on a lock held by another connection to the same file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed engine.
///
/// Several processes may open the same file; each write is a single
/// statement, so concurrent writers resolve as last-write-wins per key.
pub struct SqliteEngine {
  conn: Mutex<Option<Connection>>,
}

impl SqliteEngine {
  /// Open (or create) a database file and bring its schema up to date.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, StorageError> {
    run_migrations(&conn)?;
    Ok(Self {
      conn: Mutex::new(Some(conn)),
    })
  }

  fn with_conn<R>(
    &self,
    f: impl FnOnce(&Connection) -> rusqlite::Result<R>,
  ) -> Result<R, StorageError> {
    let guard = self
      .conn
      .lock()
      .map_err(|e| StorageError::Poisoned(e.to_string()))?;
    let conn = guard.as_ref().ok_or(StorageError::Unavailable)?;
    Ok(f(conn)?)
  }
}

/// Apply the schema if the file is older than `SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
  let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

  if version > SCHEMA_VERSION {
    return Err(StorageError::SchemaVersion {
      found: version,
      supported: SCHEMA_VERSION,
    });
  }

  if version < SCHEMA_VERSION {
    conn.execute_batch(SCHEMA_V1)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tracing::debug!(from = version, to = SCHEMA_VERSION, "migrated offline store schema");
  }

  Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
  Ok(StoredRecord {
    key: row.get(0)?,
    data: row.get(1)?,
    stored_at: row.get(2)?,
    expires_at: row.get(3)?,
  })
}

/// Raw `pending_actions` row before headers are decoded.
type ActionRow = (i64, String, String, String, Option<String>, i64);

impl StorageEngine for SqliteEngine {
  fn get(&self, store: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
    self.with_conn(|conn| {
      conn
        .query_row(
          "SELECT key, data, stored_at, expires_at FROM entries
           WHERE store = ?1 AND key = ?2",
          params![store, key],
          record_from_row,
        )
        .optional()
    })
  }

  fn put(&self, store: &str, record: &StoredRecord) -> Result<(), StorageError> {
    self.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO entries (store, key, data, stored_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
          store,
          record.key,
          record.data,
          record.stored_at,
          record.expires_at
        ],
      )
    })?;
    Ok(())
  }

  fn delete(&self, store: &str, key: &str) -> Result<(), StorageError> {
    self.with_conn(|conn| {
      conn.execute(
        "DELETE FROM entries WHERE store = ?1 AND key = ?2",
        params![store, key],
      )
    })?;
    Ok(())
  }

  fn delete_if_unchanged(&self, store: &str, record: &StoredRecord) -> Result<bool, StorageError> {
    let removed = self.with_conn(|conn| {
      conn.execute(
        "DELETE FROM entries
         WHERE store = ?1 AND key = ?2 AND stored_at = ?3 AND expires_at IS ?4",
        params![store, record.key, record.stored_at, record.expires_at],
      )
    })?;
    Ok(removed > 0)
  }

  fn scan(&self, store: &str) -> Result<Vec<StoredRecord>, StorageError> {
    self.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT key, data, stored_at, expires_at FROM entries
         WHERE store = ?1",
      )?;
      let rows = stmt.query_map(params![store], record_from_row)?;
      rows.collect()
    })
  }

  fn clear(&self, store: &str) -> Result<(), StorageError> {
    self.with_conn(|conn| conn.execute("DELETE FROM entries WHERE store = ?1", params![store]))?;
    Ok(())
  }

  fn append_action(
    &self,
    action: &NewAction,
    enqueued_at: DateTime<Utc>,
  ) -> Result<i64, StorageError> {
    let headers = serde_json::to_string(&action.headers)?;

    self.with_conn(|conn| {
      conn.execute(
        "INSERT INTO pending_actions (url, method, headers, body, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
          action.url,
          action.method,
          headers,
          action.body,
          enqueued_at.timestamp_millis()
        ],
      )?;
      Ok(conn.last_insert_rowid())
    })
  }

  fn pending_actions(&self) -> Result<Vec<PendingAction>, StorageError> {
    let rows: Vec<ActionRow> = self.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT id, url, method, headers, body, enqueued_at FROM pending_actions
         ORDER BY id",
      )?;
      let rows = stmt.query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })?;
      rows.collect()
    })?;

    rows
      .into_iter()
      .map(|(id, url, method, headers, body, enqueued_at)| -> Result<_, StorageError> {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)?;
        Ok(PendingAction {
          id,
          url,
          method,
          headers,
          body,
          enqueued_at: from_millis(enqueued_at)?,
        })
      })
      .collect()
  }

  fn delete_action(&self, id: i64) -> Result<(), StorageError> {
    self.with_conn(|conn| conn.execute("DELETE FROM pending_actions WHERE id = ?1", params![id]))?;
    Ok(())
  }

  fn close(&self) -> Result<(), StorageError> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| StorageError::Poisoned(e.to_string()))?;

    match guard.take() {
      Some(conn) => conn.close().map_err(|(_, e)| StorageError::Sqlite(e)),
      None => Ok(()),
    }
  }
}
