use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::api_types::into_remote_records;
use super::{records_path, route, RemoteApi};
use crate::error::RemoteError;
use crate::store::{Medicine, MutationKind, RecordTable, RemoteRecord};

/// HTTP client for the telemedicine REST API
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
  /// Bearer token attached by the host, if any
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, RemoteError> {
    // Url::join drops the last segment unless the base ends with a slash
    let base_url = if base_url.ends_with('/') {
      Url::parse(base_url)?
    } else {
      Url::parse(&format!("{}/", base_url))?
    };

    let client = reqwest::Client::builder().timeout(timeout).build()?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
    Ok(self.base_url.join(path.trim_start_matches('/'))?)
  }

  async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, RemoteError> {
    let mut request = self.client.request(method, self.endpoint(path)?);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(RemoteError::Rejected {
        status: status.as_u16(),
        body,
      });
    }

    let bytes = response.bytes().await?;
    if bytes.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
  }

  /// Whether the server answers at all. Any HTTP status counts as reachable.
  pub async fn ping(&self, path: &str) -> bool {
    let Ok(url) = self.endpoint(path) else {
      return false;
    };
    self.client.get(url).send().await.is_ok()
  }
}

#[async_trait]
impl RemoteApi for HttpRemote {
  async fn replay(&self, kind: MutationKind, body: &Value) -> Result<Value, RemoteError> {
    let route = route(kind);
    self.send(route.method, route.path, Some(body)).await
  }

  async fn fetch_records(
    &self,
    table: RecordTable,
    owner_id: &str,
  ) -> Result<Vec<RemoteRecord>, RemoteError> {
    let response = self
      .send(Method::GET, &records_path(table, owner_id), None)
      .await?;
    into_remote_records(response)
  }

  async fn fetch_medicines(&self) -> Result<Vec<Medicine>, RemoteError> {
    let response = self.send(Method::GET, "/pharmacy/", None).await?;
    serde_json::from_value(response).map_err(|e| RemoteError::Decode(e.to_string()))
  }

  async fn fetch_profile(&self, user_id: &str) -> Result<Value, RemoteError> {
    self
      .send(Method::GET, &format!("/patients/{}", user_id), None)
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_keeps_base_path() {
    let remote = HttpRemote::new("https://clinic.example/api", None, Duration::from_secs(5)).unwrap();
    assert_eq!(
      remote.endpoint("/records/").unwrap().as_str(),
      "https://clinic.example/api/records/"
    );
    assert_eq!(
      remote.endpoint("pharmacy/").unwrap().as_str(),
      "https://clinic.example/api/pharmacy/"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(matches!(
      HttpRemote::new("not a url", None, Duration::from_secs(5)),
      Err(RemoteError::Endpoint(_))
    ));
  }

  #[tokio::test]
  async fn test_unreachable_server_is_transport_error() {
    // Port 9 (discard) on localhost is expected to refuse connections
    let remote = HttpRemote::new("http://127.0.0.1:9/", None, Duration::from_secs(2)).unwrap();
    let err = remote.fetch_medicines().await.unwrap_err();
    assert!(matches!(err, RemoteError::Transport(_) | RemoteError::Timeout));
    assert!(!remote.ping("/").await);
  }
}
