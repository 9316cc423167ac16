//! Client-side caching and offline support.
//!
//! - [`cache`]: memory LRU and SQLite layers behind a strategy-driven manager
//! - [`queue`]: durable offline mutation queue with bounded retry
//! - [`quota`]: storage usage reporting
//!
//! Nothing here is a global; build instances at the composition root and
//! pass them down.

pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod queue;
pub mod quota;

pub use cache::{CacheError, CacheManager, CacheOptions, Strategy};
pub use config::Config;
pub use db::Database;
pub use queue::{OfflineQueue, QueueHandlers};
pub use quota::{format_bytes, QuotaReporter};
