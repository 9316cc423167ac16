//! Offline mutation queue.
//!
//! Operations performed while the backend is unreachable are appended here
//! and replayed later against handlers keyed by operation type. Items that
//! keep failing are parked as failed until someone resets or removes them.

mod item;
mod offline;
mod storage;

pub use item::{generate_id, OfflineQueueItem, QueueData, QueueStatus, DEFAULT_MAX_RETRIES};
pub use offline::{OfflineQueue, ProcessSummary, QueueHandlers, Subscription};
pub use storage::{MemoryQueueStorage, QueueStorage, SqliteQueueStorage};
