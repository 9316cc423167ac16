//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Values that can live in both cache layers.
///
/// The persistent layer stores values as JSON, so anything cached must
/// round-trip through serde.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Advisory priority attached to an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  #[default]
  Normal,
  Low,
}

impl Priority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::High => "high",
      Self::Normal => "normal",
      Self::Low => "low",
    }
  }
}

impl FromStr for Priority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "high" => Ok(Self::High),
      "normal" => Ok(Self::Normal),
      "low" => Ok(Self::Low),
      other => Err(format!("unknown priority '{}'", other)),
    }
  }
}

/// How the cache manager reconciles cached state with the fetcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Memory, then persistent, then fetch
  #[default]
  CacheFirst,
  /// Fetch, falling back to cached data when the fetch fails
  NetworkFirst,
  /// Never fetch
  CacheOnly,
  /// Always fetch and store
  NetworkOnly,
  /// Serve cached data immediately and refresh in the background
  StaleWhileRevalidate,
}

impl Strategy {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::CacheFirst => "cache-first",
      Self::NetworkFirst => "network-first",
      Self::CacheOnly => "cache-only",
      Self::NetworkOnly => "network-only",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
    }
  }
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Strategy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "cache-first" => Ok(Self::CacheFirst),
      "network-first" => Ok(Self::NetworkFirst),
      "cache-only" => Ok(Self::CacheOnly),
      "network-only" => Ok(Self::NetworkOnly),
      "stale-while-revalidate" => Ok(Self::StaleWhileRevalidate),
      other => Err(format!("unknown cache strategy '{}'", other)),
    }
  }
}

/// Write-time (and, for the manager, read-time) options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
  /// Strategy override; the manager's default applies when unset
  pub strategy: Option<Strategy>,
  /// Relative time-to-live; `None` means the entry never expires
  pub ttl: Option<Duration>,
  pub tags: BTreeSet<String>,
  pub priority: Priority,
  /// Upper bound on how long the fetcher may run
  pub timeout: Option<Duration>,
}

impl CacheOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn strategy(mut self, strategy: Strategy) -> Self {
    self.strategy = Some(strategy);
    self
  }

  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  pub fn priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// Metadata carried alongside a cached value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
  #[serde(default)]
  pub tags: BTreeSet<String>,
  #[serde(default)]
  pub priority: Priority,
}

/// One cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub key: String,
  pub data: T,
  /// When the entry was written
  pub timestamp: DateTime<Utc>,
  /// Absolute expiry; `None` never expires
  pub expires_at: Option<DateTime<Utc>>,
  pub metadata: CacheMetadata,
}

impl<T> CacheEntry<T> {
  /// Build an entry written at `now` with the given options.
  pub fn new(key: impl Into<String>, data: T, options: &CacheOptions, now: DateTime<Utc>) -> Self {
    // A ttl too large to represent behaves like no ttl at all.
    let expires_at = options
      .ttl
      .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
      .and_then(|ttl| now.checked_add_signed(ttl));

    Self {
      key: key.into(),
      data,
      timestamp: now,
      expires_at,
      metadata: CacheMetadata {
        tags: options.tags.clone(),
        priority: options.priority,
      },
    }
  }

  /// An entry is expired from its `expires_at` instant onwards.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| now >= at)
  }

  pub fn has_tag(&self, tag: &str) -> bool {
    self.metadata.tags.contains(tag)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, source: CacheSource) -> Self {
    Self { data, source }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the fetcher
  Network,
  /// Memory layer hit
  Memory,
  /// Persistent layer hit
  Persistent,
  /// Fetch failed, serving cached data
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_strategy_round_trips_through_str() {
    for strategy in [
      Strategy::CacheFirst,
      Strategy::NetworkFirst,
      Strategy::CacheOnly,
      Strategy::NetworkOnly,
      Strategy::StaleWhileRevalidate,
    ] {
      assert_eq!(strategy.as_str().parse::<Strategy>(), Ok(strategy));
    }
    assert!("lru".parse::<Strategy>().is_err());
  }

  #[test]
  fn test_entry_expiry_boundary() {
    let now = Utc::now();
    let options = CacheOptions::new().ttl(Duration::from_millis(1000));
    let entry = CacheEntry::new("user:1", 1, &options, now);

    assert!(!entry.is_expired(now + chrono::Duration::milliseconds(999)));
    assert!(entry.is_expired(now + chrono::Duration::milliseconds(1000)));
  }

  #[test]
  fn test_entry_without_ttl_never_expires() {
    let now = Utc::now();
    let entry = CacheEntry::new("k", "v", &CacheOptions::default(), now);
    assert!(entry.expires_at.is_none());
    assert!(!entry.is_expired(now + chrono::Duration::days(3650)));
  }

  #[test]
  fn test_strategy_deserializes_kebab_case() {
    let strategy: Strategy = serde_json::from_str("\"stale-while-revalidate\"").unwrap();
    assert_eq!(strategy, Strategy::StaleWhileRevalidate);
  }
}
