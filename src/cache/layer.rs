//! Cache manager that layers memory over persistent storage and reconciles
//! both with a caller-supplied fetcher.

use color_eyre::{eyre::Report, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::error::CacheError;
use super::memory::MemoryCache;
use super::persistent::PersistentCache;
use super::storage::{CacheStorage, SqliteStorage};
use super::traits::{CacheOptions, CacheResult, CacheSource, Cacheable, Strategy};
use crate::config::Config;
use crate::db::Database;

/// The two cache layers, shared with background revalidation tasks.
struct Layers<T, S: CacheStorage> {
  memory: Mutex<MemoryCache<T>>,
  persistent: PersistentCache<T, S>,
}

impl<T: Cacheable, S: CacheStorage> Layers<T, S> {
  fn memory(&self) -> MutexGuard<'_, MemoryCache<T>> {
    // Memory state is rebuilt from the persistent layer anyway, so a
    // poisoned lock is still usable.
    self.memory.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Memory, then persistent (backfilling memory on a persistent hit).
  async fn read_cached(&self, key: &str) -> Result<Option<CacheResult<T>>> {
    if let Some(data) = self.memory().get(key) {
      return Ok(Some(CacheResult::from_cache(data, CacheSource::Memory)));
    }

    match self.persistent.get_entry(key).await? {
      Some(entry) => {
        let data = entry.data.clone();
        self.memory().insert_entry(entry);
        Ok(Some(CacheResult::from_cache(data, CacheSource::Persistent)))
      }
      None => Ok(None),
    }
  }

  /// Cached data for a failed fetch. Persistent read errors count as a miss.
  async fn read_fallback(&self, key: &str) -> Option<T> {
    if let Some(data) = self.memory().get(key) {
      return Some(data);
    }

    match self.persistent.get(key).await {
      Ok(data) => data,
      Err(e) => {
        warn!(key, error = %e, "persistent fallback read failed");
        None
      }
    }
  }

  /// Write through to both layers.
  async fn store(&self, key: &str, data: T, options: &CacheOptions) -> Result<()> {
    self.memory().set(key, data.clone(), options);
    self.persistent.set(key, data, options).await
  }
}

/// Run the fetcher, bounded by the caller's timeout if one was given.
async fn fetch<T, F, Fut>(key: &str, fetcher: F, timeout: Option<Duration>) -> Result<T>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  match timeout {
    Some(timeout) => tokio::time::timeout(timeout, fetcher())
      .await
      .map_err(|_| {
        Report::new(CacheError::FetchTimeout {
          key: key.to_string(),
          timeout,
        })
      })?,
    None => fetcher().await,
  }
}

/// Single entry point over the memory and persistent cache layers.
///
/// Cloning is cheap; clones share both layers.
///
/// Stale-while-revalidate refreshes run as tasks on the current Tokio
/// runtime. Called from any other executor, the cached value is still
/// returned but the refresh is skipped.
pub struct CacheManager<T, S: CacheStorage = SqliteStorage> {
  layers: Arc<Layers<T, S>>,
  default_strategy: Strategy,
  default_ttl: Option<Duration>,
}

impl<T: Cacheable> CacheManager<T, SqliteStorage> {
  /// Build a manager from configuration over an already opened database.
  pub fn from_config(config: &Config, db: Arc<Database>) -> Self {
    let cache = &config.cache;
    let storage = SqliteStorage::from_database(db, cache.namespace.clone());

    let mut manager = Self::new(
      MemoryCache::new(cache.memory_capacity),
      PersistentCache::with_storage(storage),
    )
    .with_default_strategy(cache.default_strategy);
    if let Some(ttl_ms) = cache.default_ttl_ms {
      manager = manager.with_default_ttl(Duration::from_millis(ttl_ms));
    }
    manager
  }
}

impl<T: Cacheable, S: CacheStorage> CacheManager<T, S> {
  pub fn new(memory: MemoryCache<T>, persistent: PersistentCache<T, S>) -> Self {
    Self {
      layers: Arc::new(Layers {
        memory: Mutex::new(memory),
        persistent,
      }),
      default_strategy: Strategy::default(),
      default_ttl: None,
    }
  }

  /// Strategy used when a call does not name one.
  pub fn with_default_strategy(mut self, strategy: Strategy) -> Self {
    self.default_strategy = strategy;
    self
  }

  /// TTL applied to writes that do not carry their own.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = Some(ttl);
    self
  }

  pub fn default_strategy(&self) -> Strategy {
    self.default_strategy
  }

  /// Direct access to the memory layer. Do not hold the guard across an await.
  pub fn memory(&self) -> MutexGuard<'_, MemoryCache<T>> {
    self.layers.memory()
  }

  pub fn persistent(&self) -> &PersistentCache<T, S> {
    &self.layers.persistent
  }

  fn resolve(&self, options: &CacheOptions) -> (Strategy, CacheOptions) {
    let strategy = options.strategy.unwrap_or(self.default_strategy);
    let mut options = options.clone();
    if options.ttl.is_none() {
      options.ttl = self.default_ttl;
    }
    (strategy, options)
  }

  /// Get `key` according to the selected strategy.
  pub async fn get<F, Fut>(&self, key: &str, fetcher: F, options: &CacheOptions) -> Result<T>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Ok(self.get_with_source(key, fetcher, options).await?.data)
  }

  /// Like [`get`](Self::get), also reporting where the value came from.
  pub async fn get_with_source<F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: &CacheOptions,
  ) -> Result<CacheResult<T>>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (strategy, options) = self.resolve(options);

    match strategy {
      Strategy::CacheFirst => self.cache_first(key, fetcher, &options).await,
      Strategy::NetworkFirst => self.network_first(key, fetcher, &options).await,
      Strategy::CacheOnly => self.cache_only(key).await,
      Strategy::NetworkOnly => self.network_only(key, fetcher, &options).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(key, fetcher, &options).await,
    }
  }

  async fn cache_first<F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: &CacheOptions,
  ) -> Result<CacheResult<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(hit) = self.layers.read_cached(key).await? {
      return Ok(hit);
    }

    self.network_only(key, fetcher, options).await
  }

  async fn network_first<F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: &CacheOptions,
  ) -> Result<CacheResult<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    match fetch(key, fetcher, options.timeout).await {
      Ok(data) => {
        self.layers.store(key, data.clone(), options).await?;
        Ok(CacheResult::from_network(data))
      }
      Err(err) => {
        warn!(key, error = %err, "fetch failed, falling back to cache");
        match self.layers.read_fallback(key).await {
          Some(data) => Ok(CacheResult::offline(data)),
          None => Err(err),
        }
      }
    }
  }

  async fn cache_only(&self, key: &str) -> Result<CacheResult<T>> {
    match self.layers.read_cached(key).await? {
      Some(hit) => Ok(hit),
      None => Err(CacheError::miss(key).into()),
    }
  }

  async fn network_only<F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: &CacheOptions,
  ) -> Result<CacheResult<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let data = fetch(key, fetcher, options.timeout).await?;
    self.layers.store(key, data.clone(), options).await?;
    Ok(CacheResult::from_network(data))
  }

  async fn stale_while_revalidate<F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: &CacheOptions,
  ) -> Result<CacheResult<T>>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    match self.layers.read_cached(key).await? {
      Some(hit) => {
        self.spawn_revalidation(key, fetcher, options);
        Ok(hit)
      }
      None => self.network_only(key, fetcher, options).await,
    }
  }

  /// Detached refresh. Never awaited; failures are logged and dropped.
  fn spawn_revalidation<F, Fut>(&self, key: &str, fetcher: F, options: &CacheOptions)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      warn!(key = %key, "no Tokio runtime, skipping background revalidation");
      return;
    };

    let layers = Arc::clone(&self.layers);
    let key = key.to_string();
    let options = options.clone();

    runtime.spawn(async move {
      let refreshed = match fetch(&key, fetcher, options.timeout).await {
        Ok(data) => layers.store(&key, data, &options).await,
        Err(e) => Err(e),
      };

      match refreshed {
        Ok(()) => debug!(key = %key, "revalidated cache entry"),
        Err(e) => warn!(key = %key, error = %e, "background revalidation failed"),
      }
    });
  }

  /// Write through to both layers.
  pub async fn set(&self, key: &str, data: T, options: &CacheOptions) -> Result<()> {
    let (_, options) = self.resolve(options);
    self.layers.store(key, data, &options).await
  }

  /// Delete from both layers, returning whether either held the key.
  pub async fn delete(&self, key: &str) -> Result<bool> {
    let in_memory = self.memory().delete(key);
    let persisted = self.layers.persistent.delete(key).await?;
    Ok(in_memory || persisted)
  }

  pub async fn clear(&self) -> Result<()> {
    self.memory().clear();
    self.layers.persistent.clear().await
  }

  /// Drop tagged entries from the memory layer.
  ///
  /// Persistent entries carrying the tag are left in place; they can come
  /// back through a later persistent hit until they expire or are deleted.
  pub fn invalidate_by_tag(&self, tag: &str) -> usize {
    let removed = self.memory().invalidate_by_tag(tag);
    debug!(tag, removed, "invalidated tagged entries");
    removed
  }

  /// Sweep expired entries from both layers.
  pub async fn cleanup(&self) -> Result<usize> {
    let from_memory = self.memory().cleanup();
    let from_disk = self.layers.persistent.cleanup().await?;
    Ok(from_memory + from_disk)
  }
}

impl<T, S: CacheStorage> Clone for CacheManager<T, S> {
  fn clone(&self) -> Self {
    Self {
      layers: Arc::clone(&self.layers),
      default_strategy: self.default_strategy,
      default_ttl: self.default_ttl,
    }
  }
}
