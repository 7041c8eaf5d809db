//! Remote API used to replay queued mutations and to refresh cached data.

mod api_types;
mod client;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::error::RemoteError;
use crate::store::{Medicine, MutationKind, RecordTable, RemoteRecord};

pub use client::HttpRemote;

/// Endpoint a queued mutation is replayed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  pub method: Method,
  pub path: &'static str,
}

/// Route for each mutation kind.
pub fn route(kind: MutationKind) -> Route {
  match kind {
    MutationKind::HealthRecord => Route {
      method: Method::POST,
      path: "/records/",
    },
    MutationKind::Consultation => Route {
      method: Method::POST,
      path: "/queues/",
    },
  }
}

/// List endpoint for an owner's records.
pub fn records_path(table: RecordTable, owner_id: &str) -> String {
  match table {
    RecordTable::HealthRecords => format!("/records/patient/{}", owner_id),
    RecordTable::Consultations => format!("/queues/patient/{}", owner_id),
  }
}

/// Server operations the cache needs.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  /// Send a queued mutation body. Returns the server's reply.
  async fn replay(&self, kind: MutationKind, body: &Value) -> Result<Value, RemoteError>;

  async fn fetch_records(
    &self,
    table: RecordTable,
    owner_id: &str,
  ) -> Result<Vec<RemoteRecord>, RemoteError>;

  async fn fetch_medicines(&self) -> Result<Vec<Medicine>, RemoteError>;

  async fn fetch_profile(&self, user_id: &str) -> Result<Value, RemoteError>;
}

/// Server id in a reply, if it carries one.
pub fn remote_id(reply: &Value) -> Option<String> {
  api_types::id_string(reply.get("id")?)
}
