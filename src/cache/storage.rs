//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use super::traits::{CacheEntry, CacheMetadata, Cacheable, Priority};
use crate::db::Database;

/// Trait for durable cache storage backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Get a stored entry by key, expired or not.
  fn get_entry<T: Cacheable>(&self, key: &str) -> Result<Option<CacheEntry<T>>>;

  /// Store an entry, replacing any existing one with the same key.
  fn put_entry<T: Cacheable>(&self, entry: &CacheEntry<T>) -> Result<()>;

  /// Delete an entry, returning whether one existed.
  fn delete_entry(&self, key: &str) -> Result<bool>;

  /// Delete every entry.
  fn clear(&self) -> Result<()>;

  /// All stored keys.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete entries whose expiry is at or before `now`.
  fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when persistence is disabled - all operations are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get_entry<T: Cacheable>(&self, _key: &str) -> Result<Option<CacheEntry<T>>> {
    Ok(None) // Always miss
  }

  fn put_entry<T: Cacheable>(&self, _entry: &CacheEntry<T>) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete_entry(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage.
///
/// Entries are scoped by namespace so several typed caches can share one
/// database file.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
  db: Arc<Database>,
  namespace: String,
}

impl SqliteStorage {
  /// Open (or create) a database at `path`.
  pub fn open(path: &Path, namespace: impl Into<String>) -> Result<Self> {
    let db = Database::open(path)?;
    Ok(Self::from_database(Arc::new(db), namespace))
  }

  /// Private non-durable storage, mostly for tests.
  pub fn open_in_memory(namespace: impl Into<String>) -> Result<Self> {
    let db = Database::open_in_memory()?;
    Ok(Self::from_database(Arc::new(db), namespace))
  }

  /// Use an already opened database.
  pub fn from_database(db: Arc<Database>, namespace: impl Into<String>) -> Self {
    Self {
      db,
      namespace: namespace.into(),
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn database(&self) -> &Arc<Database> {
    &self.db
  }
}

impl CacheStorage for SqliteStorage {
  fn get_entry<T: Cacheable>(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
    let conn = self.db.conn()?;

    let row: Option<(Vec<u8>, i64, Option<i64>, String, String)> = conn
      .query_row(
        "SELECT data, timestamp, expires_at, tags, priority FROM cache_entries
         WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    let Some((data, timestamp, expires_at, tags, priority)) = row else {
      return Ok(None);
    };

    let data: T =
      serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize entry {}: {}", key, e))?;
    let tags: BTreeSet<String> =
      serde_json::from_str(&tags).map_err(|e| eyre!("Failed to parse tags for {}: {}", key, e))?;
    let priority: Priority = priority.parse().map_err(|e: String| eyre!(e))?;

    Ok(Some(CacheEntry {
      key: key.to_string(),
      data,
      timestamp: from_millis(timestamp)?,
      expires_at: expires_at.map(from_millis).transpose()?,
      metadata: CacheMetadata { tags, priority },
    }))
  }

  fn put_entry<T: Cacheable>(&self, entry: &CacheEntry<T>) -> Result<()> {
    let data =
      serde_json::to_vec(&entry.data).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
    let tags = serde_json::to_string(&entry.metadata.tags)
      .map_err(|e| eyre!("Failed to serialize tags: {}", e))?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (namespace, key, data, timestamp, expires_at, tags, priority)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          self.namespace,
          entry.key,
          data,
          entry.timestamp.timestamp_millis(),
          entry.expires_at.map(|at| at.timestamp_millis()),
          tags,
          entry.metadata.priority.as_str(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.key, e))?;

    Ok(())
  }

  fn delete_entry(&self, key: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;

    Ok(removed > 0)
  }

  fn clear(&self) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ?",
        params![self.namespace],
      )
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM cache_entries WHERE namespace = ? ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![self.namespace], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }

  fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
    let conn = self.db.conn()?;
    // Served by idx_cache_entries_expires.
    let removed = conn
      .execute(
        "DELETE FROM cache_entries
         WHERE namespace = ? AND expires_at IS NOT NULL AND expires_at <= ?",
        params![self.namespace, now.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to sweep expired entries: {}", e))?;

    Ok(removed)
  }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| eyre!("Invalid timestamp in cache: {}", ms))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::CacheOptions;
  use std::time::Duration;

  #[test]
  fn test_put_and_get_preserve_metadata() {
    let storage = SqliteStorage::open_in_memory("test").unwrap();
    let now = Utc::now();
    let options = CacheOptions::new()
      .ttl(Duration::from_secs(60))
      .tag("users")
      .priority(Priority::High);
    let entry = CacheEntry::new("user:1", vec![1, 2, 3], &options, now);

    storage.put_entry(&entry).unwrap();
    let loaded: CacheEntry<Vec<i32>> = storage.get_entry("user:1").unwrap().unwrap();

    assert_eq!(loaded.data, vec![1, 2, 3]);
    assert_eq!(loaded.timestamp.timestamp_millis(), now.timestamp_millis());
    assert_eq!(
      loaded.expires_at.map(|t| t.timestamp_millis()),
      entry.expires_at.map(|t| t.timestamp_millis())
    );
    assert!(loaded.has_tag("users"));
    assert_eq!(loaded.metadata.priority, Priority::High);
  }

  #[test]
  fn test_namespaces_are_isolated() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let users = SqliteStorage::from_database(db.clone(), "users");
    let posts = SqliteStorage::from_database(db, "posts");

    let entry = CacheEntry::new("1", "ana".to_string(), &CacheOptions::default(), Utc::now());
    users.put_entry(&entry).unwrap();

    assert!(posts.get_entry::<String>("1").unwrap().is_none());
    assert_eq!(users.keys().unwrap(), vec!["1".to_string()]);
    posts.clear().unwrap();
    assert_eq!(users.keys().unwrap().len(), 1);
  }

  #[test]
  fn test_delete_expired_uses_cutoff() {
    let storage = SqliteStorage::open_in_memory("test").unwrap();
    let now = Utc::now();
    let short = CacheOptions::new().ttl(Duration::from_secs(1));
    let long = CacheOptions::new().ttl(Duration::from_secs(3600));

    storage.put_entry(&CacheEntry::new("a", 1, &short, now)).unwrap();
    storage.put_entry(&CacheEntry::new("b", 2, &long, now)).unwrap();
    storage
      .put_entry(&CacheEntry::new("c", 3, &CacheOptions::default(), now))
      .unwrap();

    let removed = storage
      .delete_expired(now + chrono::Duration::seconds(10))
      .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(storage.keys().unwrap(), vec!["b".to_string(), "c".to_string()]);
  }

  #[test]
  fn test_delete_reports_presence() {
    let storage = SqliteStorage::open_in_memory("test").unwrap();
    storage
      .put_entry(&CacheEntry::new("a", 1, &CacheOptions::default(), Utc::now()))
      .unwrap();

    assert!(storage.delete_entry("a").unwrap());
    assert!(!storage.delete_entry("a").unwrap());
  }

  #[test]
  fn test_type_mismatch_is_an_error() {
    let storage = SqliteStorage::open_in_memory("test").unwrap();
    storage
      .put_entry(&CacheEntry::new("a", "text".to_string(), &CacheOptions::default(), Utc::now()))
      .unwrap();

    assert!(storage.get_entry::<u64>("a").is_err());
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    storage
      .put_entry(&CacheEntry::new("a", 1, &CacheOptions::default(), Utc::now()))
      .unwrap();
    assert!(storage.get_entry::<i32>("a").unwrap().is_none());
    assert!(storage.keys().unwrap().is_empty());
  }
}
