//! Queue item definition and state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

/// Default number of attempts before an item is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Operation payload.
pub type QueueData = serde_json::Value;

/// Item state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
  /// Waiting for the next drain
  Pending,
  /// Handler currently running
  Processing,
  /// Retry ceiling reached, needs explicit intervention
  Failed,
  /// Handler succeeded; such items are removed rather than kept
  Completed,
}

/// One pending mutating operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueItem {
  pub id: String,
  /// Selects the handler at drain time
  #[serde(rename = "type")]
  pub kind: String,
  pub data: QueueData,
  pub timestamp: DateTime<Utc>,
  pub retries: u32,
  pub max_retries: u32,
  pub status: QueueStatus,
  /// Message from the most recent handler failure
  #[serde(default)]
  pub last_error: Option<String>,
}

impl OfflineQueueItem {
  pub fn new(kind: impl Into<String>, data: QueueData, max_retries: u32) -> Self {
    Self {
      id: generate_id(),
      kind: kind.into(),
      data,
      timestamp: Utc::now(),
      retries: 0,
      max_retries,
      status: QueueStatus::Pending,
      last_error: None,
    }
  }

  pub fn is_pending(&self) -> bool {
    self.status == QueueStatus::Pending
  }

  pub fn is_failed(&self) -> bool {
    self.status == QueueStatus::Failed
  }

  /// Count a failed attempt and return the resulting status.
  pub fn record_failure(&mut self, error: impl Display) -> QueueStatus {
    self.retries += 1;
    self.last_error = Some(error.to_string());
    self.status = if self.retries >= self.max_retries {
      QueueStatus::Failed
    } else {
      QueueStatus::Pending
    };
    self.status
  }

  /// Put the item back in line with a fresh retry budget.
  pub fn reset(&mut self) {
    self.retries = 0;
    self.last_error = None;
    self.status = QueueStatus::Pending;
  }
}

/// Millisecond timestamp plus a random suffix.
pub fn generate_id() -> String {
  let suffix = Uuid::new_v4().simple().to_string();
  format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..9])
}
