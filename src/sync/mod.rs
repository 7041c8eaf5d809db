//! Sync engine: replays the sync queue against the remote API.
//!
//! A drain pass walks the queue oldest first, one entry at a time. Each
//! failure is isolated to its entry: the retry count is bumped and the pass
//! moves on, so one bad mutation never blocks the rest of the queue. Later
//! entries of the same owner are held back until the next pass to keep that
//! owner's mutations in order. An entry that fails `max_retries` times is
//! dropped and reported through [`SyncMetrics`].

mod metrics;

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::connectivity::Connectivity;
use crate::error::RemoteError;
use crate::queue::SyncQueue;
use crate::remote::{self, RemoteApi};
use crate::store::{LocalStore, MutationKind, QueueEntry};

pub use metrics::{AbandonedMutation, SyncMetrics, SyncMetricsSnapshot};

/// Log target for abandoned mutations, so operators can route them separately.
pub const ABANDONED_TARGET: &str = "telemed_sync::abandoned";

#[derive(Debug, Clone)]
pub struct SyncConfig {
  /// Failed attempts after which an entry is dropped: with 3, the third failure abandons it
  pub max_retries: u32,
  /// Bound on each remote call
  pub request_timeout: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      request_timeout: Duration::from_secs(20),
    }
  }
}

/// Per-pass counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub synced: usize,
  /// Failed and kept for a later pass
  pub failed: usize,
  pub abandoned: usize,
  /// Skipped because an earlier entry of the same owner failed this pass
  pub deferred: usize,
  /// Entries with a kind this build does not know
  pub dropped_unknown: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  /// Not online; nothing attempted.
  Offline,
  /// Another pass was in flight; this trigger was coalesced into it.
  AlreadyRunning,
  Completed(DrainReport),
}

enum Failure {
  Retry,
  Abandoned,
}

pub struct SyncEngine<R: RemoteApi> {
  store: Arc<LocalStore>,
  queue: SyncQueue,
  remote: Arc<R>,
  connectivity: Connectivity,
  config: SyncConfig,
  metrics: SyncMetrics,
  /// Held for the duration of a pass
  pass: Mutex<()>,
}

impl<R: RemoteApi> SyncEngine<R> {
  pub fn new(
    store: Arc<LocalStore>,
    remote: Arc<R>,
    connectivity: Connectivity,
    config: SyncConfig,
  ) -> Self {
    Self {
      queue: SyncQueue::new(Arc::clone(&store)),
      store,
      remote,
      connectivity,
      config,
      metrics: SyncMetrics::new(),
      pass: Mutex::new(()),
    }
  }

  pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
    self.metrics = metrics;
    self
  }

  pub fn metrics(&self) -> &SyncMetrics {
    &self.metrics
  }

  /// Run one drain pass over the queue.
  pub async fn drain(&self) -> DrainOutcome {
    if !self.connectivity.is_online() {
      debug!("skipping drain while offline");
      return DrainOutcome::Offline;
    }

    let Ok(_pass) = self.pass.try_lock() else {
      debug!("drain already in flight");
      return DrainOutcome::AlreadyRunning;
    };

    let entries = match self.queue.list() {
      Ok(entries) => entries,
      Err(e) => {
        error!(error = %e, "failed to read sync queue");
        return DrainOutcome::Completed(DrainReport::default());
      }
    };

    let mut report = DrainReport::default();
    let mut held_owners: HashSet<String> = HashSet::new();

    for entry in &entries {
      if entry.owner_id().is_some_and(|owner| held_owners.contains(owner)) {
        debug!(id = entry.id, "deferring entry behind failed mutation of same owner");
        report.deferred += 1;
        continue;
      }

      let Some(kind) = entry.mutation_kind() else {
        warn!(id = entry.id, kind = %entry.kind, "dropping queue entry of unknown kind");
        self.remove(entry.id);
        report.dropped_unknown += 1;
        continue;
      };

      match self.replay(kind, entry).await {
        Ok(reply) => {
          self.confirm(kind, entry, &reply);
          report.synced += 1;
        }
        Err(err) => {
          if let Some(owner) = entry.owner_id() {
            held_owners.insert(owner.to_string());
          }
          match self.register_failure(entry, &err) {
            Failure::Retry => report.failed += 1,
            Failure::Abandoned => report.abandoned += 1,
          }
        }
      }
    }

    self.metrics.record_pass(&report);
    info!(
      synced = report.synced,
      failed = report.failed,
      abandoned = report.abandoned,
      deferred = report.deferred,
      "drain pass finished"
    );

    DrainOutcome::Completed(report)
  }

  async fn replay(&self, kind: MutationKind, entry: &QueueEntry) -> Result<Value, RemoteError> {
    let body = entry.body();
    match tokio::time::timeout(self.config.request_timeout, self.remote.replay(kind, &body))
    .await
    {
      Ok(result) => result,
      Err(_) => Err(RemoteError::Timeout),
    }
  }

  /// Mark the originating record synced and drop the entry.
  fn confirm(&self, kind: MutationKind, entry: &QueueEntry, reply: &Value) {
    let table = kind.table();

    match entry.record_id() {
      Some(record_id) => {
        let remote_id = remote::remote_id(reply);
        if let Err(e) = self.store.confirm(table, record_id, remote_id.as_deref()) {
          warn!(id = entry.id, record_id, error = %e, "synced mutation but could not mark record");
        }
      }
      None => warn!(id = entry.id, "synced mutation carries no local record id"),
    }

    debug!(id = entry.id, kind = kind.as_str(), "mutation synced");
    self.remove(entry.id);
  }

  fn register_failure(&self, entry: &QueueEntry, err: &RemoteError) -> Failure {
    let retry_count = match self.queue.bump_retry(entry.id) {
      Ok(Some(count)) => count,
      // Entry vanished underneath us (store cleared)
      Ok(None) => return Failure::Retry,
      Err(e) => {
        error!(id = entry.id, error = %e, "failed to record retry");
        entry.retry_count + 1
      }
    };

    if retry_count < self.config.max_retries {
      warn!(id = entry.id, retry_count, error = %err, "mutation replay failed");
      return Failure::Retry;
    }

    self.remove(entry.id);
    let abandoned = AbandonedMutation {
      entry_id: entry.id,
      kind: entry.kind.clone(),
      record_id: entry.record_id(),
      retry_count,
      last_error: err.to_string(),
    };
    warn!(
      target: ABANDONED_TARGET,
      id = entry.id,
      kind = %entry.kind,
      record_id = ?abandoned.record_id,
      retry_count,
      error = %err,
      "mutation abandoned after exhausting retries"
    );
    self.metrics.record_abandoned(&abandoned);

    Failure::Abandoned
  }

  fn remove(&self, id: i64) {
    if let Err(e) = self.queue.remove(id) {
      error!(id, error = %e, "failed to remove queue entry");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::OfflineCache;
  use crate::connectivity::ConnectivityMonitor;
  use crate::store::{NewRecord, RecordTable, RemoteRecord};
  use crate::testing::ScriptedRemote;
  use serde_json::json;
  use std::sync::Mutex as StdMutex;

  struct Fixture {
    store: Arc<LocalStore>,
    remote: Arc<ScriptedRemote>,
    monitor: ConnectivityMonitor,
    engine: Arc<SyncEngine<ScriptedRemote>>,
  }

  fn fixture(remote: ScriptedRemote) -> Fixture {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let remote = Arc::new(remote);
    let monitor = ConnectivityMonitor::new(true);
    let engine = Arc::new(SyncEngine::new(
      Arc::clone(&store),
      Arc::clone(&remote),
      monitor.handle(),
      SyncConfig::default(),
    ));
    Fixture {
      store,
      remote,
      monitor,
      engine,
    }
  }

  impl Fixture {
    fn cache(&self) -> OfflineCache {
      OfflineCache::new(Arc::clone(&self.store), self.monitor.handle())
    }

    fn queue(&self) -> SyncQueue {
      SyncQueue::new(Arc::clone(&self.store))
    }

    async fn completed(&self) -> DrainReport {
      match self.engine.drain().await {
        DrainOutcome::Completed(report) => report,
        other => panic!("expected a completed pass, got {:?}", other),
      }
    }
  }

  fn rejected() -> RemoteError {
    RemoteError::Rejected {
      status: 503,
      body: "maintenance".to_string(),
    }
  }

  #[tokio::test]
  async fn test_drain_offline_is_noop() {
    let f = fixture(ScriptedRemote::default());
    f.monitor.observe(false);
    f.cache()
      .write_through(RecordTable::HealthRecords, "p-1", json!({"symptoms": "fever"}))
      .unwrap();

    assert_eq!(f.engine.drain().await, DrainOutcome::Offline);
    assert_eq!(f.queue().len().unwrap(), 1);
    assert!(f.remote.replayed().is_empty());
  }

  #[tokio::test]
  async fn test_successful_sync_confirms_and_clears() {
    let f = fixture(ScriptedRemote::default().replay_ok(json!({"id": 314})));
    let record = f
      .cache()
      .write_through(RecordTable::HealthRecords, "p-1", json!({"symptoms": "fever"}))
      .unwrap();

    let report = f.completed().await;

    assert_eq!(report.synced, 1);
    assert!(f.queue().is_empty().unwrap());
    let stored = f
      .store
      .get(RecordTable::HealthRecords, record.id)
      .unwrap()
      .unwrap();
    assert!(stored.synced);
    assert_eq!(stored.remote_id.as_deref(), Some("314"));
    assert_eq!(
      f.remote.replayed(),
      vec![(
        MutationKind::HealthRecord,
        json!({"symptoms": "fever", "patient_id": "p-1"})
      )]
    );
  }

  #[tokio::test]
  async fn test_replayed_body_names_the_patient() {
    let f = fixture(ScriptedRemote::default());
    f.cache()
      .write_through(RecordTable::HealthRecords, "12", json!({"symptoms": "fever"}))
      .unwrap();

    f.completed().await;

    let (_, body) = &f.remote.replayed()[0];
    assert_eq!(body["patient_id"], json!(12));
    assert_eq!(body["symptoms"], json!("fever"));
  }

  #[tokio::test]
  async fn test_entry_abandoned_after_third_failure() {
    let remote = ScriptedRemote::default()
      .replay_err(rejected())
      .replay_err(RemoteError::Timeout)
      .replay_err(rejected());
    let f = fixture(remote);
    let record = f
      .cache()
      .write_through(RecordTable::Consultations, "p-1", json!({"symptoms_brief": "cough"}))
      .unwrap();

    let first = f.completed().await;
    assert_eq!(first.failed, 1);
    assert_eq!(f.queue().list().unwrap()[0].retry_count, 1);

    let second = f.completed().await;
    assert_eq!(second.failed, 1);
    assert_eq!(f.queue().list().unwrap()[0].retry_count, 2);

    let third = f.completed().await;
    assert_eq!(third.abandoned, 1);
    assert!(f.queue().list().unwrap().is_empty());

    // Never comes back, and the record stays unsynced
    let fourth = f.completed().await;
    assert_eq!(fourth, DrainReport::default());
    assert!(f.queue().list().unwrap().is_empty());
    assert!(
      !f.store
        .get(RecordTable::Consultations, record.id)
        .unwrap()
        .unwrap()
        .synced
    );
    assert_eq!(f.engine.metrics().snapshot().total_abandoned, 1);
    assert_eq!(f.remote.replayed().len(), 3);
  }

  #[tokio::test]
  async fn test_abandon_hook_receives_mutation() {
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let engine = SyncEngine::new(
      Arc::clone(&store),
      Arc::new(ScriptedRemote::default().replay_err(rejected())),
      Connectivity::fixed(true),
      SyncConfig {
        max_retries: 1,
        ..SyncConfig::default()
      },
    )
    .with_metrics(SyncMetrics::new().with_abandon_hook(move |m| sink.lock().unwrap().push(m.clone())));

    let record = store
      .put(RecordTable::HealthRecords, NewRecord::local("p-1", json!({})))
      .unwrap();
    SyncQueue::new(Arc::clone(&store)).enqueue(MutationKind::HealthRecord, &SyncQueue::envelope(&record));

    engine.drain().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].record_id, Some(record.id));
    assert_eq!(seen[0].retry_count, 1);
    assert!(seen[0].last_error.contains("503"));
  }

  #[tokio::test]
  async fn test_failure_does_not_abort_pass() {
    let remote = ScriptedRemote::default()
      .replay_err(rejected())
      .replay_ok(json!({"id": 2}));
    let f = fixture(remote);
    let cache = f.cache();
    let failing = cache
      .write_through(RecordTable::HealthRecords, "p-1", json!({"n": 1}))
      .unwrap();
    let passing = cache
      .write_through(RecordTable::HealthRecords, "p-2", json!({"n": 2}))
      .unwrap();

    let report = f.completed().await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.synced, 1);
    let remaining = f.queue().list().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].record_id(), Some(failing.id));
    assert!(
      f.store
        .get(RecordTable::HealthRecords, passing.id)
        .unwrap()
        .unwrap()
        .synced
    );
  }

  #[tokio::test]
  async fn test_same_owner_entries_wait_behind_failure() {
    let f = fixture(ScriptedRemote::default().replay_err(rejected()));
    let cache = f.cache();
    cache
      .write_through(RecordTable::HealthRecords, "p-1", json!({"n": 1}))
      .unwrap();
    cache
      .write_through(RecordTable::Consultations, "p-1", json!({"n": 2}))
      .unwrap();

    let report = f.completed().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(f.remote.replayed().len(), 1);

    let retries: Vec<_> = f
      .queue()
      .list()
      .unwrap()
      .into_iter()
      .map(|e| e.retry_count)
      .collect();
    assert_eq!(retries, vec![1, 0]);

    // Next pass succeeds and replays both in their original order
    let report = f.completed().await;
    assert_eq!(report.synced, 2);
    let bodies: Vec<_> = f.remote.replayed().into_iter().map(|(_, body)| body).collect();
    let ns: Vec<_> = bodies.iter().map(|body| body["n"].as_i64().unwrap()).collect();
    assert_eq!(ns, vec![1, 1, 2]);
  }

  #[tokio::test]
  async fn test_replays_in_enqueue_order() {
    let f = fixture(ScriptedRemote::default());
    let cache = f.cache();
    for n in 0..4 {
      cache
        .write_through(RecordTable::Consultations, &format!("p-{}", n % 2), json!({"n": n}))
        .unwrap();
    }

    f.completed().await;

    let order: Vec<_> = f
      .remote
      .replayed()
      .into_iter()
      .map(|(_, body)| body["n"].as_i64().unwrap())
      .collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
  }

  #[tokio::test]
  async fn test_unknown_kind_is_dropped() {
    let f = fixture(ScriptedRemote::default());
    f.queue()
      .enqueue_at("emergencyAlert", &json!({"id": 1}), chrono::Utc::now());

    let report = f.completed().await;
    assert_eq!(report.dropped_unknown, 1);
    assert!(f.queue().is_empty().unwrap());
    assert!(f.remote.replayed().is_empty());
  }

  #[tokio::test]
  async fn test_missing_record_still_clears_entry() {
    let f = fixture(ScriptedRemote::default());
    f.queue().enqueue(
      MutationKind::HealthRecord,
      &json!({"id": 404, "owner_id": "p-1", "payload": {}}),
    );

    let report = f.completed().await;
    assert_eq!(report.synced, 1);
    assert!(f.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_slow_remote_counts_as_failure() {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let engine = SyncEngine::new(
      Arc::clone(&store),
      Arc::new(ScriptedRemote::default().with_delay(Duration::from_secs(5))),
      Connectivity::fixed(true),
      SyncConfig {
        request_timeout: Duration::from_millis(20),
        ..SyncConfig::default()
      },
    );
    let queue = SyncQueue::new(Arc::clone(&store));
    queue.enqueue(MutationKind::Consultation, &json!({"id": 1, "payload": {}}));

    let outcome = engine.drain().await;

    assert!(matches!(outcome, DrainOutcome::Completed(ref r) if r.failed == 1));
    assert_eq!(queue.list().unwrap()[0].retry_count, 1);
  }

  #[tokio::test]
  async fn test_overlapping_trigger_is_coalesced() {
    let f = fixture(ScriptedRemote::default().with_delay(Duration::from_millis(100)));
    f.cache()
      .write_through(RecordTable::HealthRecords, "p-1", json!({}))
      .unwrap();

    let engine = Arc::clone(&f.engine);
    let running = tokio::spawn(async move { engine.drain().await });
    tokio::task::yield_now().await;

    assert_eq!(f.engine.drain().await, DrainOutcome::AlreadyRunning);
    assert!(matches!(
      running.await.unwrap(),
      DrainOutcome::Completed(ref r) if r.synced == 1
    ));
    assert_eq!(f.remote.replayed().len(), 1);
  }

  fn server_row(remote_id: &str, owner_id: &str, payload: Value) -> RemoteRecord {
    RemoteRecord {
      remote_id: remote_id.to_string(),
      owner_id: owner_id.to_string(),
      payload,
      created_at: chrono::Utc::now(),
    }
  }

  #[tokio::test]
  async fn test_confirm_after_server_copy_was_cached_keeps_one_row() {
    let f = fixture(ScriptedRemote::default().replay_ok(json!({"id": 314})));
    let local = f
      .cache()
      .write_through(RecordTable::HealthRecords, "p-1", json!({"symptoms": "fever"}))
      .unwrap();
    // A read-through lands the server copy while the replay is in flight
    f.store
      .upsert_remote(
        RecordTable::HealthRecords,
        &[server_row("314", "p-1", json!({"symptoms": "fever"}))],
      )
      .unwrap();

    assert_eq!(f.completed().await.synced, 1);

    let records = f.store.get_by_owner(RecordTable::HealthRecords, "p-1").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, local.id);
    assert_eq!(records[0].remote_id.as_deref(), Some("314"));
    assert!(records[0].synced);
  }

  #[tokio::test]
  async fn test_read_records_through_remote_merges_with_synced_write() {
    let remote = ScriptedRemote::default()
      .replay_ok(json!({"id": 21}))
      .with_records(vec![
        server_row("20", "p-1", json!({"symptoms": "rash"})),
        server_row("21", "p-1", json!({"symptoms": "fever"})),
        server_row("30", "p-2", json!({"symptoms": "cough"})),
      ]);
    let f = fixture(remote);
    let cache = f.cache();
    let local = cache
      .write_through(RecordTable::HealthRecords, "p-1", json!({"symptoms": "fever"}))
      .unwrap();
    f.completed().await;

    let result = cache
      .read_records(RecordTable::HealthRecords, "p-1", || {
        f.remote.fetch_records(RecordTable::HealthRecords, "p-1")
      })
      .await;

    assert!(result.is_from_network());
    let mut remote_ids: Vec<_> = result
      .data
      .iter()
      .filter_map(|r| r.remote_id.clone())
      .collect();
    remote_ids.sort();
    assert_eq!(remote_ids, vec!["20", "21"]);
    assert!(result.data.iter().any(|r| r.id == local.id));
    assert!(result.data.iter().all(|r| r.synced));
  }

  #[tokio::test]
  async fn test_offline_write_syncs_after_reconnect() {
    let f = fixture(ScriptedRemote::default().replay_ok(json!({"id": 77})));
    f.monitor.observe(false);

    let record = f
      .cache()
      .write_through(RecordTable::Consultations, "p-3", json!({"symptoms_brief": "fever"}))
      .unwrap();
    assert_eq!(f.engine.drain().await, DrainOutcome::Offline);

    f.monitor.observe(true);
    f.completed().await;

    let records = f
      .cache()
      .read_records(RecordTable::Consultations, "p-3", || async {
        Err(RemoteError::Timeout)
      })
      .await
      .data;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, record.id);
    assert!(records[0].synced);
  }
}
