//! Test doubles for the remote API and reachability probe.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::connectivity::ReachabilityProbe;
use crate::error::RemoteError;
use crate::remote::RemoteApi;
use crate::store::{Medicine, MutationKind, RecordTable, RemoteRecord};

/// Remote API answering replays from a script. Once the script runs out every
/// replay succeeds with an empty object. Record fetches serve the rows given to
/// `with_records`; every other fetch fails.
#[derive(Default)]
pub struct ScriptedRemote {
  replies: Mutex<VecDeque<Result<Value, RemoteError>>>,
  replayed: Mutex<Vec<(MutationKind, Value)>>,
  records: Option<Vec<RemoteRecord>>,
  delay: Option<Duration>,
}

impl ScriptedRemote {
  pub fn replay_ok(self, reply: Value) -> Self {
    self.push(Ok(reply))
  }

  pub fn replay_err(self, err: RemoteError) -> Self {
    self.push(Err(err))
  }

  /// Server rows returned by `fetch_records`, filtered by owner.
  pub fn with_records(mut self, records: Vec<RemoteRecord>) -> Self {
    self.records = Some(records);
    self
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  fn push(self, reply: Result<Value, RemoteError>) -> Self {
    self.replies.lock().unwrap().push_back(reply);
    self
  }

  /// Every replay attempt so far, in call order.
  pub fn replayed(&self) -> Vec<(MutationKind, Value)> {
    self.replayed.lock().unwrap().clone()
  }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
  async fn replay(&self, kind: MutationKind, body: &Value) -> Result<Value, RemoteError> {
    self.replayed.lock().unwrap().push((kind, body.clone()));
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    let next = self.replies.lock().unwrap().pop_front();
    next.unwrap_or_else(|| Ok(json!({})))
  }

  async fn fetch_records(
    &self,
    _table: RecordTable,
    owner_id: &str,
  ) -> Result<Vec<RemoteRecord>, RemoteError> {
    match &self.records {
      Some(records) => Ok(
        records
          .iter()
          .filter(|r| r.owner_id == owner_id)
          .cloned()
          .collect(),
      ),
      None => Err(RemoteError::Transport("not scripted".to_string())),
    }
  }

  async fn fetch_medicines(&self) -> Result<Vec<Medicine>, RemoteError> {
    Err(RemoteError::Transport("not scripted".to_string()))
  }

  async fn fetch_profile(&self, _user_id: &str) -> Result<Value, RemoteError> {
    Err(RemoteError::Transport("not scripted".to_string()))
  }
}

/// Probe returning scripted observations, repeating the last one forever.
pub struct ScriptedProbe {
  observations: Mutex<VecDeque<bool>>,
  last: Mutex<bool>,
}

impl ScriptedProbe {
  pub fn new(observations: impl IntoIterator<Item = bool>) -> Self {
    Self {
      observations: Mutex::new(observations.into_iter().collect()),
      last: Mutex::new(false),
    }
  }
}

#[async_trait]
impl ReachabilityProbe for ScriptedProbe {
  async fn is_reachable(&self) -> bool {
    let mut last = self.last.lock().unwrap();
    if let Some(next) = self.observations.lock().unwrap().pop_front() {
      *last = next;
    }
    *last
  }
}
