pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// SQLite connection shared by the persistent cache and the offline queue.
#[derive(Debug)]
pub struct Database {
  conn: Mutex<Connection>,
  /// `None` for in-memory databases
  path: Option<PathBuf>,
}

impl Database {
  /// Open or create the database at the default location
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self {
      conn: Mutex::new(conn),
      path: Some(path.to_path_buf()),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private, non-durable database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
      path: None,
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offcache").join("cache.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  /// Whether the database lives on disk and survives restarts.
  pub fn is_durable(&self) -> bool {
    self.path.is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_open_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    let db = Database::open(&path).unwrap();
    assert!(path.exists());
    assert!(db.is_durable());
    assert_eq!(db.path(), Some(path.as_path()));
  }

  #[test]
  fn test_migrations_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    drop(Database::open(&path).unwrap());
    let db = Database::open(&path).unwrap();
    let tables: i64 = db
      .conn()
      .unwrap()
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(tables, 2);
  }

  #[test]
  fn test_in_memory_is_not_durable() {
    let db = Database::open_in_memory().unwrap();
    assert!(!db.is_durable());
    assert!(db.path().is_none());
  }
}
