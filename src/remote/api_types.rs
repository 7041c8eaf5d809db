//! Server response shapes and conversion into cached rows.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::error::RemoteError;
use crate::store::RemoteRecord;

/// Ids arrive as numbers from the server but are kept as text locally.
pub(crate) fn id_string(value: &Value) -> Option<String> {
  match value {
    Value::Number(n) => Some(n.to_string()),
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    _ => None,
  }
}

/// Parse a server timestamp. Naive timestamps are taken as UTC.
pub(crate) fn parse_server_time(s: &str) -> Option<DateTime<Utc>> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
    .map(|dt| dt.and_utc())
    .ok()
}

/// Convert one element of a record/queue list response.
///
/// The whole object is kept as the payload; `id` and `patient_id` become the
/// remote id and owner.
pub(crate) fn into_remote_record(value: Value) -> Result<RemoteRecord, RemoteError> {
  let remote_id = value
    .get("id")
    .and_then(id_string)
    .ok_or_else(|| RemoteError::Decode("record without id".to_string()))?;

  let owner_id = value
    .get("patient_id")
    .and_then(id_string)
    .ok_or_else(|| RemoteError::Decode(format!("record {} without patient_id", remote_id)))?;

  let created_at = value
    .get("created_at")
    .and_then(Value::as_str)
    .and_then(parse_server_time)
    .unwrap_or_else(Utc::now);

  Ok(RemoteRecord {
    remote_id,
    owner_id,
    payload: value,
    created_at,
  })
}

pub(crate) fn into_remote_records(value: Value) -> Result<Vec<RemoteRecord>, RemoteError> {
  match value {
    Value::Array(items) => items.into_iter().map(into_remote_record).collect(),
    other => Err(RemoteError::Decode(format!(
      "expected a list of records, got {}",
      other
    ))),
  }
}
