//! Usage and capacity reporting for the persistent storage layer.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::db::Database;

/// Raw usage estimate reported by a substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
  pub usage: u64,
  pub quota: u64,
}

/// Storage that may be able to report its capacity and durability.
///
/// `Ok(None)` means the substrate has no such capability, which is not an
/// error.
pub trait QuotaSubstrate: Send + Sync {
  fn estimate(&self) -> Result<Option<StorageEstimate>>;

  /// Ask the substrate not to evict our data.
  fn request_persistence(&self) -> Result<Option<bool>> {
    Ok(None)
  }

  fn is_persisted(&self) -> Result<Option<bool>> {
    Ok(None)
  }
}

/// Substrate with none of the optional capabilities.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

impl QuotaSubstrate for Unsupported {
  fn estimate(&self) -> Result<Option<StorageEstimate>> {
    Ok(None)
  }
}

/// Quota information for the SQLite database.
///
/// Usage is the allocated page space. The quota is the configured one, or
/// SQLite's own page limit when none is configured.
#[derive(Debug, Clone)]
pub struct SqliteQuota {
  db: Arc<Database>,
  quota_bytes: Option<u64>,
}

impl SqliteQuota {
  pub fn new(db: Arc<Database>, quota_bytes: Option<u64>) -> Self {
    Self { db, quota_bytes }
  }

  fn pragma(&self, name: &str) -> Result<u64> {
    let conn = self.db.conn()?;
    let value: i64 = conn
      .query_row(&format!("PRAGMA {}", name), [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read PRAGMA {}: {}", name, e))?;
    Ok(value.max(0) as u64)
  }
}

impl QuotaSubstrate for SqliteQuota {
  fn estimate(&self) -> Result<Option<StorageEstimate>> {
    let page_size = self.pragma("page_size")?;
    let usage = self.pragma("page_count")?.saturating_mul(page_size);
    let quota = match self.quota_bytes {
      Some(quota) => quota,
      None => self.pragma("max_page_count")?.saturating_mul(page_size),
    };

    Ok(Some(StorageEstimate { usage, quota }))
  }

  fn request_persistence(&self) -> Result<Option<bool>> {
    // A file-backed database is already durable; memory cannot become so.
    Ok(self.db.is_durable().then_some(true))
  }

  fn is_persisted(&self) -> Result<Option<bool>> {
    Ok(self.db.is_durable().then_some(true))
  }
}

/// Storage usage snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Quota {
  pub usage: u64,
  pub quota: u64,
  /// `usage / quota * 100`, or 0 when the quota is 0
  pub percentage: f64,
}

impl Quota {
  fn from_estimate(estimate: StorageEstimate) -> Self {
    let percentage = if estimate.quota == 0 {
      0.0
    } else {
      estimate.usage as f64 / estimate.quota as f64 * 100.0
    };

    Self {
      usage: estimate.usage,
      quota: estimate.quota,
      percentage,
    }
  }
}

/// Read-only view of the storage substrate's capacity.
#[derive(Debug, Clone)]
pub struct QuotaReporter<Q: QuotaSubstrate> {
  substrate: Q,
}

impl<Q: QuotaSubstrate> QuotaReporter<Q> {
  pub fn new(substrate: Q) -> Self {
    Self { substrate }
  }

  /// Current usage; all zero when the substrate cannot tell.
  pub fn get_quota(&self) -> Quota {
    match self.substrate.estimate() {
      Ok(Some(estimate)) => Quota::from_estimate(estimate),
      Ok(None) => Quota::default(),
      Err(e) => {
        warn!(error = %e, "failed to estimate storage usage");
        Quota::default()
      }
    }
  }

  pub fn request_persistent(&self) -> bool {
    flag(self.substrate.request_persistence(), "request persistent storage")
  }

  pub fn is_persisted(&self) -> bool {
    flag(self.substrate.is_persisted(), "query persistent storage")
  }
}

fn flag(result: Result<Option<bool>>, action: &str) -> bool {
  match result {
    Ok(value) => value.unwrap_or(false),
    Err(e) => {
      warn!(error = %e, "failed to {}", action);
      false
    }
  }
}

/// Human readable size, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

  if bytes == 0 {
    return "0 Bytes".to_string();
  }

  let mut value = bytes as f64;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }

  let formatted = format!("{:.2}", value);
  let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
  format!("{} {}", trimmed, UNITS[unit])
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Fixed(StorageEstimate);

  impl QuotaSubstrate for Fixed {
    fn estimate(&self) -> Result<Option<StorageEstimate>> {
      Ok(Some(self.0))
    }
  }

  struct Broken;

  impl QuotaSubstrate for Broken {
    fn estimate(&self) -> Result<Option<StorageEstimate>> {
      Err(eyre!("estimate unavailable"))
    }

    fn is_persisted(&self) -> Result<Option<bool>> {
      Err(eyre!("permission denied"))
    }
  }

  #[test]
  fn test_format_bytes() {
    assert_eq!(format_bytes(0), "0 Bytes");
    assert_eq!(format_bytes(512), "512 Bytes");
    assert_eq!(format_bytes(1024), "1 KB");
    assert_eq!(format_bytes(1536), "1.5 KB");
    assert_eq!(format_bytes(5 * 1024 * 1024), "5 MB");
    assert_eq!(format_bytes(1_288_490_189), "1.2 GB");
    assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 * 1024), "3072 GB");
  }

  #[test]
  fn test_percentage() {
    let reporter = QuotaReporter::new(Fixed(StorageEstimate {
      usage: 25,
      quota: 100,
    }));
    let quota = reporter.get_quota();
    assert_eq!(quota.usage, 25);
    assert_eq!(quota.quota, 100);
    assert_eq!(quota.percentage, 25.0);
  }

  #[test]
  fn test_zero_quota_is_zero_percent() {
    let reporter = QuotaReporter::new(Fixed(StorageEstimate { usage: 10, quota: 0 }));
    assert_eq!(reporter.get_quota().percentage, 0.0);
  }

  #[test]
  fn test_unsupported_substrate() {
    let reporter = QuotaReporter::new(Unsupported);
    assert_eq!(reporter.get_quota(), Quota::default());
    assert!(!reporter.request_persistent());
    assert!(!reporter.is_persisted());
  }

  #[test]
  fn test_substrate_errors_read_as_unknown() {
    let reporter = QuotaReporter::new(Broken);
    assert_eq!(reporter.get_quota(), Quota::default());
    assert!(!reporter.is_persisted());
  }

  #[test]
  fn test_sqlite_quota() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("cache.db")).unwrap());
    let reporter = QuotaReporter::new(SqliteQuota::new(db, Some(1024 * 1024 * 1024)));

    let quota = reporter.get_quota();
    assert!(quota.usage > 0);
    assert_eq!(quota.quota, 1024 * 1024 * 1024);
    assert!(quota.percentage > 0.0 && quota.percentage < 100.0);
    assert!(reporter.is_persisted());
    assert!(reporter.request_persistent());
  }

  #[test]
  fn test_in_memory_sqlite_is_not_persisted() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let reporter = QuotaReporter::new(SqliteQuota::new(db, None));
    assert!(reporter.get_quota().quota > 0);
    assert!(!reporter.is_persisted());
    assert!(!reporter.request_persistent());
  }
}
