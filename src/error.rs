//! Error kinds surfaced by the local store and the remote API.

use thiserror::Error;

/// Failure of a local store operation.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The underlying SQLite operation failed (disk, quota, corruption).
  #[error("storage operation failed: {0}")]
  Storage(#[from] rusqlite::Error),

  /// `update` targeted a row that does not exist.
  #[error("no row with id {id} in {table}")]
  NotFound { table: &'static str, id: i64 },

  /// A stored JSON column could not be encoded or decoded.
  #[error("failed to (de)serialize stored data: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A stored timestamp could not be parsed.
  #[error("invalid stored timestamp '{0}'")]
  Timestamp(String),

  #[error("store lock poisoned")]
  LockPoisoned,

  #[error("failed to prepare store location: {0}")]
  Io(#[from] std::io::Error),
}

/// Failure talking to the remote API. Always treated as transient by the sync engine.
#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("remote call timed out")]
  Timeout,

  #[error("transport error: {0}")]
  Transport(String),

  /// The server answered with a non-success status.
  #[error("server rejected request with status {status}: {body}")]
  Rejected { status: u16, body: String },

  #[error("could not decode server response: {0}")]
  Decode(String),

  #[error("invalid endpoint: {0}")]
  Endpoint(#[from] url::ParseError),
}

impl From<reqwest::Error> for RemoteError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      RemoteError::Timeout
    } else if e.is_decode() {
      RemoteError::Decode(e.to_string())
    } else {
      RemoteError::Transport(e.to_string())
    }
  }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
