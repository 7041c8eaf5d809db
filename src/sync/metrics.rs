use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::DrainReport;

/// A queued mutation dropped after exhausting its retries.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AbandonedMutation {
  pub entry_id: i64,
  pub kind: String,
  /// Local record left permanently unsynced
  pub record_id: Option<i64>,
  pub retry_count: u32,
  pub last_error: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetricsSnapshot {
  pub passes: u64,
  pub total_synced: u64,
  pub total_failed: u64,
  pub total_abandoned: u64,
}

type AbandonHook = Box<dyn Fn(&AbandonedMutation) + Send + Sync>;

/// Counters for drain passes plus an operator hook for abandoned mutations.
#[derive(Default)]
pub struct SyncMetrics {
  passes: AtomicU64,
  synced: AtomicU64,
  failed: AtomicU64,
  abandoned: AtomicU64,
  on_abandoned: Option<AbandonHook>,
}

impl SyncMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Call `hook` for every abandoned mutation.
  pub fn with_abandon_hook<F>(mut self, hook: F) -> Self
  where
    F: Fn(&AbandonedMutation) + Send + Sync + 'static,
  {
    self.on_abandoned = Some(Box::new(hook));
    self
  }

  pub(crate) fn record_pass(&self, report: &DrainReport) {
    self.passes.fetch_add(1, Ordering::Relaxed);
    self.synced.fetch_add(report.synced as u64, Ordering::Relaxed);
    self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
  }

  pub(crate) fn record_abandoned(&self, mutation: &AbandonedMutation) {
    self.abandoned.fetch_add(1, Ordering::Relaxed);
    if let Some(hook) = &self.on_abandoned {
      hook(mutation);
    }
  }

  pub fn snapshot(&self) -> SyncMetricsSnapshot {
    SyncMetricsSnapshot {
      passes: self.passes.load(Ordering::Relaxed),
      total_synced: self.synced.load(Ordering::Relaxed),
      total_failed: self.failed.load(Ordering::Relaxed),
      total_abandoned: self.abandoned.load(Ordering::Relaxed),
    }
  }
}
