//! Layered caching for data persistence and offline support.
//!
//! This module provides:
//! - A bounded in-memory LRU cache with lazy TTL expiration
//! - A durable SQLite-backed cache with the same entry shape
//! - A manager that layers the two and applies a fetch strategy per call
//! - Basic offline mode (serve cached data when the fetcher fails)

mod clock;
mod error;
mod layer;
mod memory;
mod persistent;
mod storage;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CacheError;
pub use layer::CacheManager;
pub use memory::{MemoryCache, DEFAULT_CAPACITY};
pub use persistent::PersistentCache;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{
  CacheEntry, CacheMetadata, CacheOptions, CacheResult, CacheSource, Cacheable, Priority, Strategy,
};
