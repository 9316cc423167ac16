//! Where the offline queue keeps its items between runs.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::{Arc, Mutex};

use super::item::OfflineQueueItem;
use crate::db::Database;

/// Backend holding the serialized queue.
pub trait QueueStorage: Send + Sync + 'static {
  fn load(&self) -> Result<Vec<OfflineQueueItem>>;

  /// Replace the stored queue with `items`.
  fn save(&self, items: &[OfflineQueueItem]) -> Result<()>;
}

/// SQLite storage keeping one JSON row per named queue.
#[derive(Debug, Clone)]
pub struct SqliteQueueStorage {
  db: Arc<Database>,
  name: String,
}

impl SqliteQueueStorage {
  pub fn new(db: Arc<Database>, name: impl Into<String>) -> Self {
    Self {
      db,
      name: name.into(),
    }
  }
}

impl QueueStorage for SqliteQueueStorage {
  fn load(&self) -> Result<Vec<OfflineQueueItem>> {
    let conn = self.db.conn()?;
    let stored: Option<String> = conn
      .query_row(
        "SELECT items FROM offline_queues WHERE name = ?",
        params![self.name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load queue {}: {}", self.name, e))?;

    match stored {
      Some(json) => serde_json::from_str(&json)
        .map_err(|e| eyre!("Failed to parse queue {}: {}", self.name, e)),
      None => Ok(Vec::new()),
    }
  }

  fn save(&self, items: &[OfflineQueueItem]) -> Result<()> {
    let json =
      serde_json::to_string(items).map_err(|e| eyre!("Failed to serialize queue: {}", e))?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO offline_queues (name, items, saved_at) VALUES (?, ?, ?)",
        params![self.name, json, Utc::now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to save queue {}: {}", self.name, e))?;

    Ok(())
  }
}

/// Volatile storage. Clones share the same items.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStorage {
  items: Arc<Mutex<Vec<OfflineQueueItem>>>,
}

impl MemoryQueueStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl QueueStorage for MemoryQueueStorage {
  fn load(&self) -> Result<Vec<OfflineQueueItem>> {
    let items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(items.clone())
  }

  fn save(&self, items: &[OfflineQueueItem]) -> Result<()> {
    let mut stored = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *stored = items.to_vec();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_sqlite_round_trip() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let storage = SqliteQueueStorage::new(db, "outbox");
    assert!(storage.load().unwrap().is_empty());

    let items = vec![
      OfflineQueueItem::new("a", json!({"n": 1}), 3),
      OfflineQueueItem::new("b", json!([1, 2]), 5),
    ];
    storage.save(&items).unwrap();
    assert_eq!(storage.load().unwrap(), items);

    storage.save(&items[1..]).unwrap();
    assert_eq!(storage.load().unwrap().len(), 1);
  }

  #[test]
  fn test_sqlite_queues_are_isolated_by_name() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let first = SqliteQueueStorage::new(db.clone(), "first");
    let second = SqliteQueueStorage::new(db, "second");

    first
      .save(&[OfflineQueueItem::new("a", json!(null), 3)])
      .unwrap();
    assert!(second.load().unwrap().is_empty());
  }

  #[test]
  fn test_corrupt_queue_is_an_error() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.conn()
      .unwrap()
      .execute(
        "INSERT INTO offline_queues (name, items, saved_at) VALUES ('q', 'not json', 0)",
        [],
      )
      .unwrap();

    assert!(SqliteQueueStorage::new(db, "q").load().is_err());
  }

  #[test]
  fn test_memory_clones_share_items() {
    let storage = MemoryQueueStorage::new();
    let other = storage.clone();
    storage
      .save(&[OfflineQueueItem::new("a", json!(1), 3)])
      .unwrap();
    assert_eq!(other.load().unwrap().len(), 1);
  }
}
