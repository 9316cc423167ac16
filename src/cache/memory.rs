//! Bounded in-process cache with lazy TTL expiration and LRU eviction.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::traits::{CacheEntry, CacheOptions};

/// Default number of entries kept in memory.
pub const DEFAULT_CAPACITY: usize = 100;

/// Fixed-capacity key/entry store.
///
/// Recency is tracked with a monotonically increasing access counter: every
/// `set` and `get` stamps the key with the current counter value. Eviction
/// scans for the smallest stamp, which is fine at the small capacities this
/// cache is meant for.
#[derive(Debug)]
pub struct MemoryCache<T> {
  entries: HashMap<String, CacheEntry<T>>,
  access_order: HashMap<String, u64>,
  access_counter: u64,
  capacity: usize,
  clock: Arc<dyn Clock>,
}

impl<T: Clone> MemoryCache<T> {
  pub fn new(capacity: usize) -> Self {
    Self::with_clock(capacity, Arc::new(SystemClock))
  }

  pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: HashMap::new(),
      access_order: HashMap::new(),
      access_counter: 0,
      // A zero capacity cache could never hold the entry it was just given.
      capacity: capacity.max(1),
      clock,
    }
  }

  /// Insert or overwrite `key`.
  pub fn set(&mut self, key: &str, data: T, options: &CacheOptions) {
    let entry = CacheEntry::new(key, data, options, self.clock.now());
    self.insert_entry(entry);
  }

  /// Insert a fully formed entry, keeping its timestamps and metadata.
  pub fn insert_entry(&mut self, entry: CacheEntry<T>) {
    if !self.entries.contains_key(&entry.key) && self.entries.len() >= self.capacity {
      self.evict_lru();
    }

    let key = entry.key.clone();
    self.entries.insert(key.clone(), entry);
    self.touch(key);
  }

  pub fn get(&mut self, key: &str) -> Option<T> {
    let now = self.clock.now();
    let expired = self.entries.get(key)?.is_expired(now);
    if expired {
      self.delete(key);
      return None;
    }

    self.touch(key.to_string());
    self.entries.get(key).map(|entry| entry.data.clone())
  }

  /// Like `get` but leaves recency untouched.
  pub fn has(&mut self, key: &str) -> bool {
    let now = self.clock.now();
    match self.entries.get(key) {
      Some(entry) if entry.is_expired(now) => {
        self.delete(key);
        false
      }
      Some(_) => true,
      None => false,
    }
  }

  pub fn delete(&mut self, key: &str) -> bool {
    self.access_order.remove(key);
    self.entries.remove(key).is_some()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.access_order.clear();
    self.access_counter = 0;
  }

  /// Remove every entry tagged with `tag`, returning how many went.
  pub fn invalidate_by_tag(&mut self, tag: &str) -> usize {
    let doomed: Vec<String> = self
      .entries
      .values()
      .filter(|entry| entry.has_tag(tag))
      .map(|entry| entry.key.clone())
      .collect();

    for key in &doomed {
      self.delete(key);
    }
    doomed.len()
  }

  /// Remove every currently expired entry.
  pub fn cleanup(&mut self) -> usize {
    let now = self.clock.now();
    let expired: Vec<String> = self
      .entries
      .values()
      .filter(|entry| entry.is_expired(now))
      .map(|entry| entry.key.clone())
      .collect();

    for key in &expired {
      self.delete(key);
    }
    expired.len()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  fn touch(&mut self, key: String) {
    self.access_order.insert(key, self.access_counter);
    self.access_counter += 1;
  }

  fn evict_lru(&mut self) {
    // Ties cannot happen with a monotonic counter; if they did, the smaller
    // key goes first.
    let victim = self
      .access_order
      .iter()
      .min_by(|(ka, a), (kb, b)| a.cmp(b).then_with(|| ka.cmp(kb)))
      .map(|(key, _)| key.clone());

    if let Some(key) = victim {
      debug!(key = %key, "evicting least recently used entry");
      self.delete(&key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use chrono::Duration;

  fn opts() -> CacheOptions {
    CacheOptions::default()
  }

  #[test]
  fn test_get_returns_value_before_ttl_and_none_after() {
    let clock = Arc::new(ManualClock::default());
    let mut cache = MemoryCache::with_clock(10, clock.clone());

    let options = CacheOptions::new().ttl(std::time::Duration::from_millis(1000));
    cache.set("user:1", "Ana".to_string(), &options);

    clock.advance(Duration::milliseconds(500));
    assert_eq!(cache.get("user:1"), Some("Ana".to_string()));

    clock.advance(Duration::milliseconds(1000));
    assert_eq!(cache.get("user:1"), None);
    // Lazy expiration removed it physically.
    assert_eq!(cache.len(), 0);
  }

  #[test]
  fn test_expired_exactly_at_boundary() {
    let clock = Arc::new(ManualClock::default());
    let mut cache = MemoryCache::with_clock(10, clock.clone());
    cache.set("k", 1, &CacheOptions::new().ttl(std::time::Duration::from_millis(100)));

    clock.advance(Duration::milliseconds(100));
    assert!(!cache.has("k"));
    assert!(cache.is_empty());
  }

  #[test]
  fn test_lru_evicts_least_recently_used() {
    let mut cache = MemoryCache::new(2);
    cache.set("a", 1, &opts());
    cache.set("b", 2, &opts());
    assert_eq!(cache.get("a"), Some(1));
    cache.set("c", 3, &opts());

    assert_eq!(cache.get("b"), None);
    assert_eq!(cache.get("a"), Some(1));
    assert_eq!(cache.get("c"), Some(3));
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn test_has_does_not_refresh_recency() {
    let mut cache = MemoryCache::new(2);
    cache.set("a", 1, &opts());
    cache.set("b", 2, &opts());
    assert!(cache.has("a"));
    cache.set("c", 3, &opts());

    assert!(!cache.has("a"));
    assert!(cache.has("b"));
  }

  #[test]
  fn test_overwrite_at_capacity_does_not_evict() {
    let mut cache = MemoryCache::new(2);
    cache.set("a", 1, &opts());
    cache.set("b", 2, &opts());
    cache.set("a", 10, &opts());

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get("a"), Some(10));
    assert_eq!(cache.get("b"), Some(2));
  }

  #[test]
  fn test_never_exceeds_capacity() {
    let mut cache = MemoryCache::new(3);
    for i in 0..20 {
      cache.set(&format!("k{}", i), i, &opts());
      assert!(cache.len() <= 3);
    }
    assert!(cache.has("k19"));
    assert!(!cache.has("k0"));
  }

  #[test]
  fn test_delete_and_clear() {
    let mut cache = MemoryCache::new(5);
    cache.set("a", 1, &opts());
    assert!(cache.delete("a"));
    assert!(!cache.delete("a"));

    cache.set("b", 2, &opts());
    cache.clear();
    assert!(cache.is_empty());
  }

  #[test]
  fn test_invalidate_by_tag() {
    let mut cache = MemoryCache::new(10);
    cache.set("u1", 1, &CacheOptions::new().tag("users"));
    cache.set("u2", 2, &CacheOptions::new().tag("users").tag("admins"));
    cache.set("p1", 3, &CacheOptions::new().tag("posts"));

    assert_eq!(cache.invalidate_by_tag("users"), 2);
    assert!(!cache.has("u1"));
    assert!(!cache.has("u2"));
    assert!(cache.has("p1"));
    assert_eq!(cache.invalidate_by_tag("users"), 0);
  }

  #[test]
  fn test_cleanup_removes_only_expired() {
    let clock = Arc::new(ManualClock::default());
    let mut cache = MemoryCache::with_clock(10, clock.clone());
    cache.set("short", 1, &CacheOptions::new().ttl(std::time::Duration::from_secs(1)));
    cache.set("long", 2, &CacheOptions::new().ttl(std::time::Duration::from_secs(60)));
    cache.set("forever", 3, &opts());

    clock.advance(Duration::seconds(5));
    assert_eq!(cache.cleanup(), 1);
    assert_eq!(cache.len(), 2);
  }
}
