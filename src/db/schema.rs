/// Schema for cache and queue tables.
pub const SCHEMA: &str = r#"
-- Cached entries (values stored as serialized JSON)
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    expires_at INTEGER,
    tags TEXT NOT NULL DEFAULT '[]',
    priority TEXT NOT NULL DEFAULT 'normal',
    PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires
    ON cache_entries(namespace, expires_at);

-- Offline queues, one serialized item list per named queue
CREATE TABLE IF NOT EXISTS offline_queues (
    name TEXT PRIMARY KEY,
    items TEXT NOT NULL,
    saved_at INTEGER NOT NULL
);
"#;
