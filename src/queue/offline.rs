//! Durable queue of operations to replay once handlers can reach the backend.

use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

use super::item::{OfflineQueueItem, QueueData, QueueStatus, DEFAULT_MAX_RETRIES};
use super::storage::{QueueStorage, SqliteQueueStorage};
use crate::config::Config;
use crate::db::Database;

type Handler = Box<dyn Fn(QueueData) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handlers keyed by operation type.
#[derive(Default)]
pub struct QueueHandlers {
  handlers: HashMap<String, Handler>,
}

impl QueueHandlers {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the handler for `kind`, replacing any earlier one.
  pub fn on<F, Fut>(mut self, kind: impl Into<String>, handler: F) -> Self
  where
    F: Fn(QueueData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    self
      .handlers
      .insert(kind.into(), Box::new(move |data| handler(data).boxed()));
    self
  }

  pub fn contains(&self, kind: &str) -> bool {
    self.handlers.contains_key(kind)
  }

  fn get(&self, kind: &str) -> Option<&Handler> {
    self.handlers.get(kind)
  }
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
  /// Handler succeeded, item removed
  pub completed: usize,
  /// Handler failed, item will be tried again
  pub retried: usize,
  /// Handler failed for the last allowed time
  pub failed: usize,
  /// No handler registered for the item's type
  pub skipped: usize,
}

type Listener = Arc<dyn Fn(&[OfflineQueueItem]) + Send + Sync>;

#[derive(Default)]
struct Listeners {
  next_id: u64,
  entries: Vec<(u64, Listener)>,
}

/// Handle returned by [`OfflineQueue::subscribe`].
///
/// The listener stays registered until the handle is dropped or
/// [`Subscription::unsubscribe`] is called.
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct Subscription {
  id: u64,
  listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
  /// Stop receiving updates. Calling this more than once is harmless.
  pub fn unsubscribe(&self) {
    if let Some(listeners) = self.listeners.upgrade() {
      let mut listeners = listeners.lock().unwrap_or_else(|e| e.into_inner());
      listeners.entries.retain(|(id, _)| *id != self.id);
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

/// Clears the in-flight flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Puts the item being handled back to pending if the drain is dropped
/// before its handler returns.
struct InFlight<'a, S: QueueStorage> {
  queue: &'a OfflineQueue<S>,
  id: Option<String>,
}

impl<S: QueueStorage> InFlight<'_, S> {
  fn finish(mut self) {
    self.id = None;
  }
}

impl<S: QueueStorage> Drop for InFlight<'_, S> {
  fn drop(&mut self) {
    let Some(id) = self.id.take() else {
      return;
    };

    let reset = {
      let mut items = self.queue.items();
      match items
        .iter_mut()
        .find(|i| i.id == id && i.status == QueueStatus::Processing)
      {
        Some(item) => {
          item.status = QueueStatus::Pending;
          true
        }
        None => false,
      }
    };

    if reset {
      debug!(id = %id, "drain cancelled, queued operation back to pending");
      self.queue.commit();
    }
  }
}

/// Ordered list of pending mutations with bounded automatic retry.
///
/// Every mutation is saved to storage right away. A failed save is logged and
/// the in-memory state is kept; the running process treats memory as the
/// source of truth.
pub struct OfflineQueue<S: QueueStorage = SqliteQueueStorage> {
  items: Mutex<Vec<OfflineQueueItem>>,
  storage: S,
  listeners: Arc<Mutex<Listeners>>,
  processing: AtomicBool,
  default_max_retries: u32,
}

impl OfflineQueue<SqliteQueueStorage> {
  /// Build the configured queue over an already opened database.
  pub fn from_config(config: &Config, db: Arc<Database>) -> Self {
    let storage = SqliteQueueStorage::new(db, config.queue.name.clone());
    Self::new(storage).with_default_max_retries(config.queue.max_retries)
  }
}

impl<S: QueueStorage> OfflineQueue<S> {
  /// Create a queue, reloading whatever `storage` holds.
  pub fn new(storage: S) -> Self {
    let mut items = match storage.load() {
      Ok(items) => items,
      Err(e) => {
        warn!(error = %e, "failed to load offline queue, starting empty");
        Vec::new()
      }
    };

    // A drain interrupted by a crash leaves items marked as processing.
    for item in items.iter_mut().filter(|i| i.status == QueueStatus::Processing) {
      item.status = QueueStatus::Pending;
    }

    Self {
      items: Mutex::new(items),
      storage,
      listeners: Arc::new(Mutex::new(Listeners::default())),
      processing: AtomicBool::new(false),
      default_max_retries: DEFAULT_MAX_RETRIES,
    }
  }

  pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
    self.default_max_retries = max_retries;
    self
  }

  fn items(&self) -> MutexGuard<'_, Vec<OfflineQueueItem>> {
    self.items.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Save and broadcast the current state.
  fn commit(&self) {
    let snapshot = self.get_all();

    if let Err(e) = self.storage.save(&snapshot) {
      warn!(error = %e, "failed to persist offline queue");
    }

    let listeners: Vec<Listener> = {
      let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
      listeners.entries.iter().map(|(_, l)| Arc::clone(l)).collect()
    };
    for listener in listeners {
      listener(&snapshot);
    }
  }

  /// Append an operation and return its id.
  pub fn add(&self, kind: impl Into<String>, data: QueueData, max_retries: u32) -> String {
    let id = {
      let mut items = self.items();
      let mut item = OfflineQueueItem::new(kind, data, max_retries);
      while items.iter().any(|existing| existing.id == item.id) {
        item.id = super::item::generate_id();
      }
      let id = item.id.clone();
      debug!(id = %id, kind = %item.kind, "queued offline operation");
      items.push(item);
      id
    };

    self.commit();
    id
  }

  /// Append an operation with the queue's default retry ceiling.
  pub fn add_default(&self, kind: impl Into<String>, data: QueueData) -> String {
    self.add(kind, data, self.default_max_retries)
  }

  /// Drain the items that are pending right now.
  ///
  /// Items without a registered handler stay pending. A call made while
  /// another drain is in flight returns immediately with an empty summary.
  pub async fn process(&self, handlers: &QueueHandlers) -> ProcessSummary {
    let mut summary = ProcessSummary::default();

    if self
      .processing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("offline queue already processing");
      return summary;
    }
    let _guard = DrainGuard(&self.processing);

    let pending: Vec<(String, String)> = self
      .items()
      .iter()
      .filter(|item| item.is_pending())
      .map(|item| (item.id.clone(), item.kind.clone()))
      .collect();

    for (id, kind) in pending {
      let Some(handler) = handlers.get(&kind) else {
        debug!(id = %id, kind = %kind, "no handler for queued operation, leaving it pending");
        summary.skipped += 1;
        continue;
      };

      // The item may have been removed while an earlier handler ran.
      let data = {
        let mut items = self.items();
        match items.iter_mut().find(|i| i.id == id && i.is_pending()) {
          Some(item) => {
            item.status = QueueStatus::Processing;
            item.data.clone()
          }
          None => continue,
        }
      };
      self.commit();

      let in_flight = InFlight {
        queue: self,
        id: Some(id.clone()),
      };
      let outcome = handler(data).await;
      in_flight.finish();

      let status = {
        let mut items = self.items();
        let Some(pos) = items.iter().position(|i| i.id == id) else {
          continue;
        };
        match outcome {
          Ok(()) => {
            items.remove(pos);
            QueueStatus::Completed
          }
          Err(e) => {
            let item = &mut items[pos];
            let status = item.record_failure(&e);
            warn!(
              id = %id,
              kind = %kind,
              retries = item.retries,
              max_retries = item.max_retries,
              error = %e,
              "queued operation failed"
            );
            status
          }
        }
      };
      self.commit();

      match status {
        QueueStatus::Completed => summary.completed += 1,
        QueueStatus::Failed => summary.failed += 1,
        _ => summary.retried += 1,
      }
    }

    if summary != ProcessSummary::default() {
      info!(
        completed = summary.completed,
        retried = summary.retried,
        failed = summary.failed,
        skipped = summary.skipped,
        "processed offline queue"
      );
    }
    summary
  }

  pub fn is_processing(&self) -> bool {
    self.processing.load(Ordering::Acquire)
  }

  pub fn remove(&self, id: &str) -> bool {
    let removed = {
      let mut items = self.items();
      let before = items.len();
      items.retain(|item| item.id != id);
      items.len() != before
    };

    if removed {
      self.commit();
    }
    removed
  }

  pub fn clear(&self) {
    self.items().clear();
    self.commit();
  }

  /// Give a failed item a fresh retry budget.
  pub fn retry(&self, id: &str) -> bool {
    let reset = {
      let mut items = self.items();
      match items.iter_mut().find(|i| i.id == id && i.is_failed()) {
        Some(item) => {
          item.reset();
          true
        }
        None => false,
      }
    };

    if reset {
      self.commit();
    }
    reset
  }

  /// Reset every failed item, returning how many were reset.
  pub fn retry_failed(&self) -> usize {
    let count = {
      let mut items = self.items();
      let mut count = 0;
      for item in items.iter_mut().filter(|i| i.is_failed()) {
        item.reset();
        count += 1;
      }
      count
    };

    if count > 0 {
      self.commit();
    }
    count
  }

  pub fn get_all(&self) -> Vec<OfflineQueueItem> {
    self.items().clone()
  }

  pub fn get_pending(&self) -> Vec<OfflineQueueItem> {
    self.items().iter().filter(|i| i.is_pending()).cloned().collect()
  }

  pub fn get_failed(&self) -> Vec<OfflineQueueItem> {
    self.items().iter().filter(|i| i.is_failed()).cloned().collect()
  }

  pub fn size(&self) -> usize {
    self.items().len()
  }

  /// Call `listener` with the current items now and after every change.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&[OfflineQueueItem]) + Send + Sync + 'static,
  {
    let listener: Listener = Arc::new(listener);
    let id = {
      let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
      let id = listeners.next_id;
      listeners.next_id += 1;
      listeners.entries.push((id, Arc::clone(&listener)));
      id
    };

    listener(&self.get_all());

    Subscription {
      id,
      listeners: Arc::downgrade(&self.listeners),
    }
  }
}
