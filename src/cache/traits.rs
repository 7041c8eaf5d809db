//! Answer metadata returned by the cache accessor.

use chrono::{DateTime, Utc};

/// Result from a read-through, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache and known)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data after a failed network fetch.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn is_from_network(&self) -> bool {
    self.source == CacheSource::Network
  }
}

impl<T: Default> CacheResult<T> {
  /// Empty answer used when the cache itself could not be read.
  pub fn unavailable() -> Self {
    Self {
      data: T::default(),
      source: CacheSource::Unavailable,
      cached_at: None,
    }
  }
}

/// Indicates where the returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Network fetch failed, cached data is still within its freshness window
  CacheFresh,
  /// Network fetch failed, cached data is older than the freshness window
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// The local store could not be read either; data is empty
  Unavailable,
}
