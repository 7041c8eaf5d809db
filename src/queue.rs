//! Ordered queue of mutations awaiting server confirmation.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::store::{CachedRecord, LocalStore, MutationKind, QueueEntry};

/// Sync queue built on the store's `sync_queue` table.
#[derive(Clone)]
pub struct SyncQueue {
  store: Arc<LocalStore>,
}

impl SyncQueue {
  pub fn new(store: Arc<LocalStore>) -> Self {
    Self { store }
  }

  /// Append a mutation with `retry_count = 0`.
  ///
  /// Failures are logged and swallowed: the local write that triggered the
  /// enqueue has already succeeded and must stay responsive.
  pub fn enqueue(&self, kind: MutationKind, data: &Value) -> Option<QueueEntry> {
    self.enqueue_at(kind.as_str(), data, Utc::now())
  }

  pub(crate) fn enqueue_at(
    &self,
    kind: &str,
    data: &Value,
    timestamp: DateTime<Utc>,
  ) -> Option<QueueEntry> {
    match self.store.insert_queue_entry(kind, data, timestamp) {
      Ok(entry) => {
        debug!(id = entry.id, kind, "queued mutation");
        Some(entry)
      }
      Err(e) => {
        warn!(kind, error = %e, "failed to queue mutation");
        None
      }
    }
  }

  /// Pending entries, oldest first.
  pub fn list(&self) -> StoreResult<Vec<QueueEntry>> {
    self.store.queue_entries()
  }

  /// Remove an entry. Removing an absent id is a no-op.
  pub fn remove(&self, id: i64) -> StoreResult<()> {
    if !self.store.delete_queue_entry(id)? {
      debug!(id, "queue entry already gone");
    }
    Ok(())
  }

  /// Increment the retry count, returning the new value (`None` if the entry is gone).
  pub fn bump_retry(&self, id: i64) -> StoreResult<Option<u32>> {
    self.store.bump_queue_retry(id)
  }

  pub fn len(&self) -> StoreResult<u64> {
    self.store.queue_len()
  }

  pub fn is_empty(&self) -> StoreResult<bool> {
    Ok(self.len()? == 0)
  }

  /// Replay payload for a locally written record: the server body plus the
  /// local id and owner needed to mark the record synced afterwards.
  pub fn envelope(record: &CachedRecord) -> Value {
    json!({
      "id": record.id,
      "owner_id": record.owner_id,
      "created_at": record.created_at,
      "payload": record.payload,
    })
  }
}
