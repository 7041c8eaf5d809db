//! Cache accessor that orchestrates local persistence with network fetching.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::traits::CacheResult;
use crate::connectivity::Connectivity;
use crate::error::{RemoteError, StoreResult};
use crate::queue::SyncQueue;
use crate::store::{
  CachedRecord, LocalStore, Medicine, NewRecord, RecordTable, RemoteRecord, UserProfile,
};

/// The facade the rest of the application reads and writes cached data through.
///
/// Reads prefer the network while online and fall back to the local store;
/// writes land locally first and are queued for replay.
#[derive(Clone)]
pub struct OfflineCache {
  store: Arc<LocalStore>,
  queue: SyncQueue,
  connectivity: Connectivity,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl OfflineCache {
  pub fn new(store: Arc<LocalStore>, connectivity: Connectivity) -> Self {
    Self {
      queue: SyncQueue::new(Arc::clone(&store)),
      store,
      connectivity,
      stale_time: Duration::minutes(60),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  fn is_stale(&self, cached_at: DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.stale_time
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  /// Read-through skeleton shared by every resource.
  ///
  /// 1. Offline: serve the store without calling `fetcher`
  /// 2. Online: fetch, persist, return the persisted view
  /// 3. Fetch or persist failure: serve the store
  /// 4. Store failure: empty answer
  async fn read_through<T, R, F, Fut, P, L>(
    &self,
    resource: &str,
    fetcher: F,
    persist: P,
    load: L,
  ) -> CacheResult<T>
  where
    T: Default,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, RemoteError>>,
    P: FnOnce(R) -> StoreResult<T>,
    L: FnOnce() -> StoreResult<(T, Option<DateTime<Utc>>)>,
  {
    let offline = !self.is_online();

    if !offline {
      match fetcher().await {
        Ok(fresh) => match persist(fresh) {
          Ok(data) => return CacheResult::from_network(data),
          Err(e) => error!(resource, error = %e, "failed to cache fresh data"),
        },
        Err(e) => warn!(resource, error = %e, "remote fetch failed, serving cache"),
      }
    }

    match load() {
      Ok((data, cached_at)) if offline => {
        debug!(resource, "offline, serving cache");
        CacheResult::offline(data, cached_at)
      }
      Ok((data, cached_at)) => {
        let stale = cached_at.map_or(true, |at| self.is_stale(at));
        CacheResult::from_cache(data, cached_at, stale)
      }
      Err(e) => {
        error!(resource, error = %e, "failed to read cache");
        CacheResult::unavailable()
      }
    }
  }

  /// Records of `owner_id` in `table`, newest first.
  ///
  /// Server rows are merged into the store by server id; pending local writes
  /// stay in the returned view.
  pub async fn read_records<F, Fut>(
    &self,
    table: RecordTable,
    owner_id: &str,
    fetcher: F,
  ) -> CacheResult<Vec<CachedRecord>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<RemoteRecord>, RemoteError>>,
  {
    self
      .read_through(
        table.name(),
        fetcher,
        |fresh: Vec<RemoteRecord>| {
          self.store.upsert_remote(table, &fresh)?;
          self.store.get_by_owner(table, owner_id)
        },
        || Ok((self.store.get_by_owner(table, owner_id)?, None)),
      )
      .await
  }

  /// The medicine inventory snapshot.
  pub async fn read_medicines<F, Fut>(&self, fetcher: F) -> CacheResult<Vec<Medicine>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<Medicine>, RemoteError>>,
  {
    self
      .read_through(
        "medicines",
        fetcher,
        |fresh: Vec<Medicine>| self.store.replace_medicines(&fresh),
        || {
          let medicines = self.store.medicines()?;
          let cached_at = medicines.iter().filter_map(|m| m.last_updated).max();
          Ok((medicines, cached_at))
        },
      )
      .await
  }

  /// Profile data for `user_id`, `None` if never cached.
  pub async fn read_profile<F, Fut>(&self, user_id: &str, fetcher: F) -> CacheResult<Option<Value>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, RemoteError>>,
  {
    self
      .read_through(
        "user_profile",
        fetcher,
        |fresh: Value| Ok(Some(self.store.upsert_profile(user_id, &fresh)?.data)),
        || {
          Ok(match self.store.profile(user_id)? {
            Some(profile) => (Some(profile.data), Some(profile.last_updated)),
            None => (None, None),
          })
        },
      )
      .await
  }

  /// Optimistic write: persist unsynced, queue for replay, return immediately.
  ///
  /// A failure to queue is logged and does not fail the write.
  pub fn write_through(
    &self,
    table: RecordTable,
    owner_id: &str,
    payload: Value,
  ) -> StoreResult<CachedRecord> {
    let record = self.store.put(table, NewRecord::local(owner_id, payload))?;
    self
      .queue
      .enqueue(table.mutation_kind(), &SyncQueue::envelope(&record));
    Ok(record)
  }

  /// Cache profile data locally without contacting the server.
  pub fn save_profile(&self, user_id: &str, data: &Value) -> StoreResult<UserProfile> {
    self.store.upsert_profile(user_id, data)
  }

  /// Mutations still waiting for the server.
  pub fn pending_mutations(&self) -> StoreResult<u64> {
    self.queue.len()
  }

  pub fn unsynced(&self, table: RecordTable) -> StoreResult<u64> {
    self.store.unsynced_count(table)
  }

  /// Wipe every cached table (logout/reset).
  pub fn clear(&self) -> StoreResult<()> {
    self.store.clear_all()
  }
}
