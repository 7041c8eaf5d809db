//! Durable local store backed by SQLite.
//!
//! Holds the per-owner record tables (health records, consultations), the
//! medicine inventory snapshot, the user profile cache and the rows of the
//! sync queue. All access goes through a single connection behind a mutex,
//! so multi-statement operations (`replace_medicines`, `update`, `clear_all`)
//! run inside one transaction and are never observed half-applied.

mod schema;
mod types;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

pub use types::{
  CachedRecord, Medicine, MutationKind, NewRecord, QueueEntry, RecordPatch, RecordTable,
  RemoteRecord, UserProfile,
};
pub(crate) use types::{format_timestamp, parse_timestamp};

/// SQLite-backed local store. Construct once per process and share it.
pub struct LocalStore {
  conn: Mutex<Connection>,
}

impl LocalStore {
  /// Open or create the store at `path`, creating parent directories as needed.
  pub fn open(path: &Path) -> StoreResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened local store");
    Self::from_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  pub fn open_in_memory() -> StoreResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> StoreResult<Self> {
    conn.execute_batch(schema::SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }

  // ==========================================================================
  // Record tables
  // ==========================================================================

  /// Persist a record, assigning an id if it has none.
  ///
  /// A record with an existing local id replaces that row in place. A server
  /// id already held by another row is a storage error; no other row is touched.
  pub fn put(&self, table: RecordTable, record: NewRecord) -> StoreResult<CachedRecord> {
    let conn = self.lock()?;
    let created_at = record.created_at.unwrap_or_else(Utc::now);
    let payload = serde_json::to_string(&record.payload)?;

    conn.execute(
      &format!(
        "INSERT INTO {} (id, owner_id, remote_id, payload, created_at, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
           owner_id = excluded.owner_id,
           remote_id = excluded.remote_id,
           payload = excluded.payload,
           created_at = excluded.created_at,
           synced = excluded.synced",
        table.name()
      ),
      params![
        record.id,
        record.owner_id,
        record.remote_id,
        payload,
        format_timestamp(created_at),
        record.synced
      ],
    )?;

    let id = record.id.unwrap_or_else(|| conn.last_insert_rowid());
    debug!(table = table.name(), id, "stored record");

    Ok(CachedRecord {
      id,
      owner_id: record.owner_id,
      remote_id: record.remote_id,
      payload: record.payload,
      created_at,
      synced: record.synced,
    })
  }

  /// Records belonging to `owner_id`, newest first.
  pub fn get_by_owner(&self, table: RecordTable, owner_id: &str) -> StoreResult<Vec<CachedRecord>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT id, owner_id, remote_id, payload, created_at, synced FROM {}
       WHERE owner_id = ?1
       ORDER BY created_at DESC, id DESC",
      table.name()
    ))?;

    let rows = stmt
      .query_map(params![owner_id], RecordRow::from_row)?
      .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(RecordRow::into_record).collect()
  }

  /// A single record by local id.
  pub fn get(&self, table: RecordTable, id: i64) -> StoreResult<Option<CachedRecord>> {
    let conn = self.lock()?;
    fetch_record(&conn, table, id)
  }

  /// Merge `patch` into the record with local id `id`.
  pub fn update(&self, table: RecordTable, id: i64, patch: RecordPatch) -> StoreResult<CachedRecord> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let mut record = fetch_record(&tx, table, id)?.ok_or(StoreError::NotFound {
      table: table.name(),
      id,
    })?;

    if let Some(fields) = patch.payload {
      merge_payload(&mut record.payload, fields);
    }
    if let Some(synced) = patch.synced {
      record.synced = synced;
    }
    if patch.remote_id.is_some() {
      record.remote_id = patch.remote_id;
    }

    tx.execute(
      &format!(
        "UPDATE {} SET payload = ?1, synced = ?2, remote_id = ?3 WHERE id = ?4",
        table.name()
      ),
      params![
        serde_json::to_string(&record.payload)?,
        record.synced,
        record.remote_id,
        id
      ],
    )?;
    tx.commit()?;

    Ok(record)
  }

  /// Mark a local record as accepted by the server, stamping `remote_id` when known.
  ///
  /// A read-through may have cached the same server row while the write was in
  /// flight. That copy is folded into the local record so the owner sees it once.
  pub fn confirm(
    &self,
    table: RecordTable,
    id: i64,
    remote_id: Option<&str>,
  ) -> StoreResult<CachedRecord> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let mut record = fetch_record(&tx, table, id)?.ok_or(StoreError::NotFound {
      table: table.name(),
      id,
    })?;

    if let Some(remote_id) = remote_id {
      let folded = tx.execute(
        &format!("DELETE FROM {} WHERE remote_id = ?1 AND id != ?2", table.name()),
        params![remote_id, id],
      )?;
      if folded > 0 {
        debug!(table = table.name(), id, remote_id, "folded cached server copy into local record");
      }
      record.remote_id = Some(remote_id.to_string());
    }
    record.synced = true;

    tx.execute(
      &format!("UPDATE {} SET synced = 1, remote_id = ?1 WHERE id = ?2", table.name()),
      params![record.remote_id, id],
    )?;
    tx.commit()?;

    Ok(record)
  }

  /// Insert or refresh server rows, matched on their server id. Stored as synced.
  pub fn upsert_remote(&self, table: RecordTable, records: &[RemoteRecord]) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    {
      let mut stmt = tx.prepare(&format!(
        "INSERT INTO {} (owner_id, remote_id, payload, created_at, synced)
         VALUES (?1, ?2, ?3, ?4, 1)
         ON CONFLICT(remote_id) DO UPDATE SET
           owner_id = excluded.owner_id,
           payload = excluded.payload,
           created_at = excluded.created_at,
           synced = 1",
        table.name()
      ))?;

      for record in records {
        stmt.execute(params![
          record.owner_id,
          record.remote_id,
          serde_json::to_string(&record.payload)?,
          format_timestamp(record.created_at)
        ])?;
      }
    }
    tx.commit()?;

    debug!(table = table.name(), count = records.len(), "cached server records");
    Ok(())
  }

  /// Number of records not yet confirmed by the server.
  pub fn unsynced_count(&self, table: RecordTable) -> StoreResult<u64> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      &format!("SELECT COUNT(*) FROM {} WHERE synced = 0", table.name()),
      [],
      |row| row.get(0),
    )?;
    Ok(count.unsigned_abs())
  }

  // ==========================================================================
  // Medicine snapshot
  // ==========================================================================

  /// Replace the whole inventory snapshot. Readers see either the old or the new snapshot.
  pub fn replace_medicines(&self, medicines: &[Medicine]) -> StoreResult<Vec<Medicine>> {
    let now = Utc::now();
    let stamped: Vec<Medicine> = medicines
      .iter()
      .cloned()
      .map(|m| Medicine {
        last_updated: Some(now),
        ..m
      })
      .collect();

    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM medicines", [])?;
    {
      let mut stmt = tx.prepare(
        "INSERT INTO medicines (name, category, stock_quantity, price, last_updated, extra)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      )?;
      for med in &stamped {
        stmt.execute(params![
          med.name,
          med.category,
          med.stock_quantity,
          med.price,
          format_timestamp(now),
          serde_json::to_string(&med.extra)?
        ])?;
      }
    }
    tx.commit()?;

    debug!(count = stamped.len(), "replaced medicine snapshot");
    Ok(stamped)
  }

  /// The current inventory snapshot, in the order it was received.
  pub fn medicines(&self) -> StoreResult<Vec<Medicine>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT name, category, stock_quantity, price, last_updated, extra
       FROM medicines ORDER BY id",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, Option<String>>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, Option<f64>>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, String>(5)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(name, category, stock_quantity, price, last_updated, extra)| {
        Ok(Medicine {
          name,
          category,
          stock_quantity,
          price,
          last_updated: Some(parse_timestamp(&last_updated)?),
          extra: serde_json::from_str::<Map<String, Value>>(&extra)?,
        })
      })
      .collect()
  }

  // ==========================================================================
  // User profile cache
  // ==========================================================================

  /// Insert or overwrite the single profile row for `user_id`.
  pub fn upsert_profile(&self, user_id: &str, data: &Value) -> StoreResult<UserProfile> {
    let conn = self.lock()?;
    let now = Utc::now();

    conn.execute(
      "INSERT INTO user_profile (user_id, data, last_updated) VALUES (?1, ?2, ?3)
       ON CONFLICT(user_id) DO UPDATE SET data = excluded.data, last_updated = excluded.last_updated",
      params![user_id, serde_json::to_string(data)?, format_timestamp(now)],
    )?;

    Ok(UserProfile {
      user_id: user_id.to_string(),
      data: data.clone(),
      last_updated: now,
    })
  }

  pub fn profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>> {
    let conn = self.lock()?;
    let row: Option<(String, String)> = conn
      .query_row(
        "SELECT data, last_updated FROM user_profile WHERE user_id = ?1",
        params![user_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((data, last_updated)) => Ok(Some(UserProfile {
        user_id: user_id.to_string(),
        data: serde_json::from_str(&data)?,
        last_updated: parse_timestamp(&last_updated)?,
      })),
      None => Ok(None),
    }
  }

  // ==========================================================================
  // Sync queue rows
  // ==========================================================================

  pub fn insert_queue_entry(
    &self,
    kind: &str,
    data: &Value,
    timestamp: DateTime<Utc>,
  ) -> StoreResult<QueueEntry> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO sync_queue (kind, data, timestamp, retry_count) VALUES (?1, ?2, ?3, 0)",
      params![kind, serde_json::to_string(data)?, format_timestamp(timestamp)],
    )?;

    Ok(QueueEntry {
      id: conn.last_insert_rowid(),
      kind: kind.to_string(),
      data: data.clone(),
      timestamp,
      retry_count: 0,
    })
  }

  /// All pending entries, oldest first.
  pub fn queue_entries(&self) -> StoreResult<Vec<QueueEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, kind, data, timestamp, retry_count FROM sync_queue
       ORDER BY timestamp ASC, id ASC",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, u32>(4)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(id, kind, data, timestamp, retry_count)| {
        Ok(QueueEntry {
          id,
          kind,
          data: serde_json::from_str(&data)?,
          timestamp: parse_timestamp(&timestamp)?,
          retry_count,
        })
      })
      .collect()
  }

  /// Delete a queue entry. Returns whether a row was removed.
  pub fn delete_queue_entry(&self, id: i64) -> StoreResult<bool> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
    Ok(removed > 0)
  }

  /// Increment the retry count of an entry, returning the new count (`None` if absent).
  pub fn bump_queue_retry(&self, id: i64) -> StoreResult<Option<u32>> {
    let conn = self.lock()?;
    let count = conn
      .query_row(
        "UPDATE sync_queue SET retry_count = retry_count + 1 WHERE id = ?1 RETURNING retry_count",
        params![id],
        |row| row.get::<_, u32>(0),
      )
      .optional()?;
    Ok(count)
  }

  pub fn queue_len(&self) -> StoreResult<u64> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
    Ok(count.unsigned_abs())
  }

  // ==========================================================================
  // Reset
  // ==========================================================================

  /// Empty every table.
  pub fn clear_all(&self) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for table in schema::TABLES {
      tx.execute(&format!("DELETE FROM {}", table), [])?;
    }
    tx.commit()?;

    debug!("cleared local store");
    Ok(())
  }
}

/// Raw record row before JSON and timestamp decoding.
struct RecordRow {
  id: i64,
  owner_id: String,
  remote_id: Option<String>,
  payload: String,
  created_at: String,
  synced: bool,
}

impl RecordRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      owner_id: row.get(1)?,
      remote_id: row.get(2)?,
      payload: row.get(3)?,
      created_at: row.get(4)?,
      synced: row.get(5)?,
    })
  }

  fn into_record(self) -> StoreResult<CachedRecord> {
    Ok(CachedRecord {
      id: self.id,
      owner_id: self.owner_id,
      remote_id: self.remote_id,
      payload: serde_json::from_str(&self.payload)?,
      created_at: parse_timestamp(&self.created_at)?,
      synced: self.synced,
    })
  }
}

fn fetch_record(conn: &Connection, table: RecordTable, id: i64) -> StoreResult<Option<CachedRecord>> {
  let row = conn
    .query_row(
      &format!(
        "SELECT id, owner_id, remote_id, payload, created_at, synced FROM {} WHERE id = ?1",
        table.name()
      ),
      params![id],
      RecordRow::from_row,
    )
    .optional()?;

  row.map(RecordRow::into_record).transpose()
}

/// Shallow merge; a non-object payload is replaced by the patch.
fn merge_payload(target: &mut Value, fields: Map<String, Value>) {
  match target {
    Value::Object(existing) => existing.extend(fields),
    other => *other = Value::Object(fields),
  }
}
