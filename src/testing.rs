//! Recorded-interaction replay.
//!
//! [`ReplayTransport`] is an [`HttpClient`] that answers requests from a
//! list of recorded interactions, in order.  Each request must match the
//! next recording on method, path, body and query; a mismatch or an
//! exhausted recording fails the request with an internal error.
//!
//! Recordings are YAML:
//!
//! ```yaml
//! - method: PUT
//!   path: /photos
//!   query: { restype: container }
//!   status: 201
//!   response_headers: { x-ms-request-id: abc }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;

use anyhow::Context;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::Deserialize;

use crate::errors::{Result, StorageError};
use crate::request::{Request, Response};
use crate::transport::HttpClient;

/// One recorded request/response pair.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordedInteraction {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    pub status: u16,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub response_body: String,
}

impl RecordedInteraction {
    fn mismatch(&self, request: &Request, flexible_query: bool) -> Option<String> {
        if !self.method.eq_ignore_ascii_case(request.method.as_str()) {
            return Some(format!("method {} != recorded {}", request.method, self.method));
        }
        if request.url.path() != self.path {
            return Some(format!("path {} != recorded {}", request.url.path(), self.path));
        }

        let actual: BTreeMap<String, String> = request
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let query_ok = if flexible_query {
            self.query.iter().all(|(k, v)| actual.get(k) == Some(v))
        } else {
            actual == self.query
        };
        if !query_ok {
            return Some(format!("query {:?} != recorded {:?}", actual, self.query));
        }

        if request.body.as_ref() != self.body.as_bytes() {
            return Some(format!(
                "body of {} bytes != recorded body of {} bytes",
                request.body.len(),
                self.body.len()
            ));
        }
        None
    }

    fn response(&self, request: &Request) -> Result<Response> {
        let status = StatusCode::from_u16(self.status).map_err(|e| {
            StorageError::Internal(anyhow::anyhow!("invalid recorded status {}: {}", self.status, e))
        })?;
        let mut headers = HeaderMap::new();
        for (name, value) in &self.response_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| StorageError::Internal(anyhow::anyhow!("invalid recorded header: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| StorageError::Internal(anyhow::anyhow!("invalid recorded header: {}", e)))?;
            headers.insert(name, value);
        }
        let mut response = Response::new(
            status,
            headers,
            Bytes::copy_from_slice(self.response_body.as_bytes()),
        );
        response.request = request.summary();
        Ok(response)
    }
}

/// Replays recorded interactions in declared order.
#[derive(Debug)]
pub struct ReplayTransport {
    interactions: Mutex<VecDeque<RecordedInteraction>>,
    flexible_query: bool,
}

impl ReplayTransport {
    pub fn new(interactions: Vec<RecordedInteraction>) -> Self {
        Self {
            interactions: Mutex::new(interactions.into()),
            flexible_query: false,
        }
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let interactions: Vec<RecordedInteraction> =
            serde_yaml::from_str(yaml).context("failed to parse recorded interactions")?;
        Ok(Self::new(interactions))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read recording {}", path.display()))?;
        Self::from_yaml(&contents)
    }

    /// Accept requests whose query contains every recorded parameter, plus
    /// any others.
    pub fn with_flexible_query(mut self, flexible: bool) -> Self {
        self.flexible_query = flexible;
        self
    }

    /// Interactions not yet replayed.
    pub fn remaining(&self) -> usize {
        self.interactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl HttpClient for ReplayTransport {
    fn send<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        Box::pin(async move {
            if request.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let next = self
                .interactions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let recorded = next.ok_or_else(|| {
                StorageError::Internal(anyhow::anyhow!(
                    "no recorded interaction left for {} {}",
                    request.method,
                    request.url.path()
                ))
            })?;
            if let Some(reason) = recorded.mismatch(request, self.flexible_query) {
                return Err(StorageError::Internal(anyhow::anyhow!(
                    "request does not match recording: {}",
                    reason
                )));
            }
            recorded.response(request)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ServiceEndpoints, StorageClient};
    use crate::credentials::Credential;
    use crate::pipeline::{new_pipeline, PipelineOptions};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const RECORDING: &str = r#"
- method: PUT
  path: /photos
  query: { restype: container }
  status: 201
  response_headers: { x-ms-request-id: rid-1, etag: '"0x1"' }
- method: PUT
  path: /photos/cat.jpg
  body: meow
  status: 201
- method: DELETE
  path: /photos
  query: { restype: container }
  status: 404
  response_headers: { x-ms-error-code: ContainerNotFound }
"#;

    fn client(transport: Arc<ReplayTransport>) -> StorageClient {
        let options = PipelineOptions {
            http_client: Some(transport),
            ..PipelineOptions::default()
        };
        let pipeline = new_pipeline(Credential::Anonymous, options).unwrap();
        let endpoints = ServiceEndpoints::for_account("acct", "https", "core.windows.net").unwrap();
        StorageClient::new(Arc::new(pipeline), endpoints)
    }

    #[tokio::test]
    async fn test_replay_in_order() {
        let transport = Arc::new(ReplayTransport::from_yaml(RECORDING).unwrap());
        let client = client(transport.clone());
        let cancel = CancellationToken::new();
        let container = client.container("photos");

        let meta = container.create(&cancel).await.unwrap();
        assert_eq!(meta.request_id.as_deref(), Some("rid-1"));
        assert_eq!(meta.etag.as_deref(), Some("\"0x1\""));

        container
            .blob("cat.jpg")
            .put(Bytes::from_static(b"meow"), None, &cancel)
            .await
            .unwrap();

        let err = container.delete(&cancel).await.unwrap_err();
        assert_eq!(err.code(), "ContainerNotFound");
        assert_eq!(transport.remaining(), 0);
    }

    #[tokio::test]
    async fn test_mismatch_fails_request() {
        let transport = Arc::new(ReplayTransport::from_yaml(RECORDING).unwrap());
        let err = client(transport)
            .container("photos")
            .delete(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InternalError");
        assert!(err.to_string().contains("method DELETE"));
    }

    #[tokio::test]
    async fn test_exhausted_recording_fails() {
        let transport = Arc::new(ReplayTransport::new(Vec::new()));
        let err = client(transport)
            .queue("jobs")
            .create(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no recorded interaction left"));
    }

    #[tokio::test]
    async fn test_flexible_query_accepts_superset() {
        let yaml = r#"
- method: GET
  path: /photos
  query: { comp: list }
  status: 200
  response_body: "<EnumerationResults><Blobs/></EnumerationResults>"
"#;
        let strict = Arc::new(ReplayTransport::from_yaml(yaml).unwrap());
        let err = client(strict)
            .container("photos")
            .list_blobs_page(None, None, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InternalError");

        let flexible = Arc::new(ReplayTransport::from_yaml(yaml).unwrap().with_flexible_query(true));
        let page = client(flexible)
            .container("photos")
            .list_blobs_page(None, None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(page.blobs.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.yaml");
        std::fs::write(&path, RECORDING).unwrap();
        assert_eq!(ReplayTransport::load(&path).unwrap().remaining(), 3);
        assert!(ReplayTransport::load(dir.path().join("missing.yaml")).is_err());
    }
}
