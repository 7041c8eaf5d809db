//! Row types for the local store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// Tables holding per-owner records that are written locally and replayed to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordTable {
  HealthRecords,
  Consultations,
}

impl RecordTable {
  pub const ALL: [RecordTable; 2] = [RecordTable::HealthRecords, RecordTable::Consultations];

  /// SQL table name
  pub fn name(self) -> &'static str {
    match self {
      Self::HealthRecords => "health_records",
      Self::Consultations => "consultations",
    }
  }

  /// Mutation kind used when a local write to this table is queued for replay.
  pub fn mutation_kind(self) -> MutationKind {
    match self {
      Self::HealthRecords => MutationKind::HealthRecord,
      Self::Consultations => MutationKind::Consultation,
    }
  }
}

/// Tag stored on each queue entry selecting the remote endpoint to replay against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
  #[serde(rename = "healthRecord")]
  HealthRecord,
  #[serde(rename = "consultation")]
  Consultation,
}

impl MutationKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::HealthRecord => "healthRecord",
      Self::Consultation => "consultation",
    }
  }

  /// Parse a stored tag. Unknown tags come from older or foreign writers and yield `None`.
  pub fn parse(tag: &str) -> Option<Self> {
    match tag {
      "healthRecord" => Some(Self::HealthRecord),
      "consultation" => Some(Self::Consultation),
      _ => None,
    }
  }

  /// Table holding the records this mutation originates from.
  pub fn table(self) -> RecordTable {
    match self {
      Self::HealthRecord => RecordTable::HealthRecords,
      Self::Consultation => RecordTable::Consultations,
    }
  }
}

/// A health record or consultation as cached locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
  /// Locally assigned id, stable once assigned
  pub id: i64,
  /// Patient or doctor the record belongs to (not enforced locally)
  pub owner_id: String,
  /// Server-assigned id once known
  pub remote_id: Option<String>,
  /// Domain fields, opaque to the cache
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  /// False until the server has accepted the record
  pub synced: bool,
}

/// Input to `LocalStore::put`.
#[derive(Debug, Clone, Default)]
pub struct NewRecord {
  /// Leave empty to have the store assign one.
  pub id: Option<i64>,
  pub owner_id: String,
  pub remote_id: Option<String>,
  pub payload: Value,
  /// Defaults to now.
  pub created_at: Option<DateTime<Utc>>,
  pub synced: bool,
}

impl NewRecord {
  /// An unsynced local write for `owner_id`.
  pub fn local(owner_id: impl Into<String>, payload: Value) -> Self {
    Self {
      owner_id: owner_id.into(),
      payload,
      ..Default::default()
    }
  }
}

/// Fields merged into an existing record by `LocalStore::update`.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
  /// Shallow-merged into the stored payload object
  pub payload: Option<Map<String, Value>>,
  pub synced: Option<bool>,
  pub remote_id: Option<String>,
}

/// A record as returned by a server list endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
  pub remote_id: String,
  pub owner_id: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
}

/// One row of the medicine inventory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medicine {
  pub name: String,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default)]
  pub stock_quantity: i64,
  #[serde(default)]
  pub price: Option<f64>,
  /// Set by the store when the snapshot is written
  #[serde(default)]
  pub last_updated: Option<DateTime<Utc>>,
  /// Remaining server fields (id, supplier, expiry, ...)
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Cached profile data for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
  pub user_id: String,
  pub data: Value,
  pub last_updated: DateTime<Utc>,
}

/// A mutation awaiting server confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
  pub id: i64,
  /// Raw stored tag; see `MutationKind::parse`
  pub kind: String,
  /// Exact payload to replay, including the local record id
  pub data: Value,
  pub timestamp: DateTime<Utc>,
  pub retry_count: u32,
}

impl QueueEntry {
  pub fn mutation_kind(&self) -> Option<MutationKind> {
    MutationKind::parse(&self.kind)
  }

  /// Local id of the record this entry was created from.
  pub fn record_id(&self) -> Option<i64> {
    self.data.get("id").and_then(Value::as_i64)
  }

  /// Owner of the originating record, used to keep per-owner replay order.
  pub fn owner_id(&self) -> Option<&str> {
    self.data.get("owner_id").and_then(Value::as_str)
  }

  /// Request body sent to the server.
  ///
  /// The owner travels as `patient_id` unless the payload already names one.
  /// Numeric owner ids are sent as numbers.
  pub fn body(&self) -> Value {
    let mut body = self.data.get("payload").cloned().unwrap_or(Value::Null);
    if let (Value::Object(map), Some(owner)) = (&mut body, self.owner_id()) {
      if !map.contains_key("patient_id") {
        let owner = owner
          .parse::<i64>()
          .map(Value::from)
          .unwrap_or_else(|_| Value::from(owner));
        map.insert("patient_id".to_string(), owner);
      }
    }
    body
  }
}

/// Format a timestamp for storage. Fixed width so text ordering matches time ordering.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(s: &str) -> StoreResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| StoreError::Timestamp(s.to_string()))
}
