//! Named cache conditions callers may want to match on.
//!
//! These travel inside a `color_eyre::Report`; recover them with
//! `report.downcast_ref::<CacheError>()`.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
  /// Cache-only read found nothing in either layer
  #[error("Cache miss for key: {key}")]
  Miss { key: String },

  /// The fetcher did not finish within the caller's timeout
  #[error("Fetch for key {key} timed out after {timeout:?}")]
  FetchTimeout { key: String, timeout: Duration },
}

impl CacheError {
  pub fn miss(key: impl Into<String>) -> Self {
    Self::Miss { key: key.into() }
  }

  pub fn is_miss(&self) -> bool {
    matches!(self, Self::Miss { .. })
  }
}
