//! Durable cache layer with lazy, single-flight initialization.

use color_eyre::{eyre::eyre, Result};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::storage::{CacheStorage, SqliteStorage};
use super::traits::{CacheEntry, CacheOptions, Cacheable};

type Opener<S> = Box<dyn Fn() -> Result<S> + Send + Sync>;

/// Durable counterpart of [`MemoryCache`](super::MemoryCache).
///
/// The backing storage is opened on first use. Concurrent first calls share
/// one in-flight initialization, so the storage is opened exactly once.
pub struct PersistentCache<T, S: CacheStorage = SqliteStorage> {
  storage: OnceCell<Arc<S>>,
  opener: Option<Opener<S>>,
  clock: Arc<dyn Clock>,
  _marker: PhantomData<fn() -> T>,
}

impl<T: Cacheable> PersistentCache<T, SqliteStorage> {
  /// Lazily open a SQLite database at `path`.
  pub fn sqlite(path: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
    let path = path.into();
    let namespace = namespace.into();
    Self::new(move || SqliteStorage::open(&path, namespace.clone()))
  }
}

impl<T: Cacheable, S: CacheStorage> PersistentCache<T, S> {
  /// Create a cache that opens its storage with `opener` on first use.
  pub fn new<F>(opener: F) -> Self
  where
    F: Fn() -> Result<S> + Send + Sync + 'static,
  {
    Self {
      storage: OnceCell::new(),
      opener: Some(Box::new(opener)),
      clock: Arc::new(SystemClock),
      _marker: PhantomData,
    }
  }

  /// Create a cache over storage that is already open.
  pub fn with_storage(storage: S) -> Self {
    Self {
      storage: OnceCell::new_with(Some(Arc::new(storage))),
      opener: None,
      clock: Arc::new(SystemClock),
      _marker: PhantomData,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Open the underlying storage. Safe to call any number of times.
  pub async fn initialize(&self) -> Result<()> {
    self.storage().await.map(|_| ())
  }

  pub fn is_initialized(&self) -> bool {
    self.storage.initialized()
  }

  async fn storage(&self) -> Result<&Arc<S>> {
    self
      .storage
      .get_or_try_init(|| async {
        let opener = self
          .opener
          .as_ref()
          .ok_or_else(|| eyre!("Persistent cache has no storage opener"))?;
        debug!("opening persistent cache storage");
        opener().map(Arc::new)
      })
      .await
  }

  pub async fn set(&self, key: &str, data: T, options: &CacheOptions) -> Result<()> {
    let entry = CacheEntry::new(key, data, options, self.clock.now());
    self.put_entry(&entry).await
  }

  /// Store a fully formed entry.
  pub async fn put_entry(&self, entry: &CacheEntry<T>) -> Result<()> {
    self.storage().await?.put_entry(entry)
  }

  pub async fn get(&self, key: &str) -> Result<Option<T>> {
    Ok(self.get_entry(key).await?.map(|entry| entry.data))
  }

  /// Read the live entry for `key`, deleting it if it has expired.
  pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
    let storage = self.storage().await?;
    let Some(entry) = storage.get_entry::<T>(key)? else {
      return Ok(None);
    };

    if entry.is_expired(self.clock.now()) {
      if let Err(e) = storage.delete_entry(key) {
        warn!(key, error = %e, "failed to delete expired entry");
      }
      return Ok(None);
    }

    Ok(Some(entry))
  }

  pub async fn has(&self, key: &str) -> Result<bool> {
    Ok(self.get_entry(key).await?.is_some())
  }

  pub async fn delete(&self, key: &str) -> Result<bool> {
    self.storage().await?.delete_entry(key)
  }

  pub async fn clear(&self) -> Result<()> {
    self.storage().await?.clear()
  }

  pub async fn keys(&self) -> Result<Vec<String>> {
    self.storage().await?.keys()
  }

  /// Remove every expired entry, returning how many went.
  pub async fn cleanup(&self) -> Result<usize> {
    let removed = self.storage().await?.delete_expired(self.clock.now())?;
    if removed > 0 {
      debug!(removed, "swept expired persistent entries");
    }
    Ok(removed)
  }
}

impl<T, S: CacheStorage> std::fmt::Debug for PersistentCache<T, S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PersistentCache")
      .field("initialized", &self.storage.initialized())
      .field("clock", &self.clock)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn in_memory() -> PersistentCache<String> {
    PersistentCache::with_storage(SqliteStorage::open_in_memory("test").unwrap())
  }

  #[tokio::test]
  async fn test_operations_initialize_implicitly() {
    let opens = Arc::new(AtomicUsize::new(0));
    let counter = opens.clone();
    let cache: PersistentCache<String> = PersistentCache::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      SqliteStorage::open_in_memory("test")
    });

    assert!(!cache.is_initialized());
    cache.set("a", "1".into(), &CacheOptions::default()).await.unwrap();
    assert!(cache.is_initialized());
    cache.initialize().await.unwrap();
    cache.initialize().await.unwrap();

    assert_eq!(cache.get("a").await.unwrap(), Some("1".to_string()));
    assert_eq!(opens.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_concurrent_first_calls_open_once() {
    let opens = Arc::new(AtomicUsize::new(0));
    let counter = opens.clone();
    let cache: PersistentCache<String> = PersistentCache::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      SqliteStorage::open_in_memory("test")
    });

    let (a, b, c) = tokio::join!(cache.has("x"), cache.keys(), cache.initialize());
    assert!(!a.unwrap());
    assert!(b.unwrap().is_empty());
    c.unwrap();
    assert_eq!(opens.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_open_failure_propagates_and_can_be_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let cache: PersistentCache<String> = PersistentCache::new(move || {
      if counter.fetch_add(1, Ordering::SeqCst) == 0 {
        Err(eyre!("disk full"))
      } else {
        SqliteStorage::open_in_memory("test")
      }
    });

    assert!(cache.get("a").await.is_err());
    assert!(cache.get("a").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_expired_entry_is_deleted_on_read() {
    let clock = Arc::new(ManualClock::default());
    let cache = in_memory().with_clock(clock.clone());
    let options = CacheOptions::new().ttl(Duration::from_millis(1000));
    cache.set("user:1", "Ana".into(), &options).await.unwrap();

    clock.advance(chrono::Duration::milliseconds(500));
    assert_eq!(cache.get("user:1").await.unwrap(), Some("Ana".to_string()));

    clock.advance(chrono::Duration::milliseconds(1000));
    assert_eq!(cache.get("user:1").await.unwrap(), None);
    assert!(cache.keys().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cleanup_counts_removed_entries() {
    let clock = Arc::new(ManualClock::default());
    let cache = in_memory().with_clock(clock.clone());
    let short = CacheOptions::new().ttl(Duration::from_secs(1));
    cache.set("a", "1".into(), &short).await.unwrap();
    cache.set("b", "2".into(), &short).await.unwrap();
    cache.set("c", "3".into(), &CacheOptions::default()).await.unwrap();

    clock.advance(chrono::Duration::seconds(2));
    assert_eq!(cache.cleanup().await.unwrap(), 2);
    assert_eq!(cache.keys().await.unwrap(), vec!["c".to_string()]);
  }

  #[tokio::test]
  async fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    let first: PersistentCache<String> = PersistentCache::sqlite(&path, "ns");
    first.set("k", "v".into(), &CacheOptions::default()).await.unwrap();
    drop(first);

    let second: PersistentCache<String> = PersistentCache::sqlite(&path, "ns");
    assert_eq!(second.get("k").await.unwrap(), Some("v".to_string()));
    assert!(second.delete("k").await.unwrap());
    assert!(!second.has("k").await.unwrap());
  }
}
