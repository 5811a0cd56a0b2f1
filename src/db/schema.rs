/// Current schema version, tracked through `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Version 1: keyed entries grouped by named store, plus the pending action queue.
pub const SCHEMA_V1: &str = r#"
-- Keyed entries; one row per (store, key)
CREATE TABLE IF NOT EXISTS entries (
    store TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    expires_at INTEGER,
    PRIMARY KEY (store, key)
);

-- Deferred write intents, replayed in id order
CREATE TABLE IF NOT EXISTS pending_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL DEFAULT '{}',
    body TEXT,
    enqueued_at INTEGER NOT NULL
);
"#;
