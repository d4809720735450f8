//! Service clients.
//!
//! [`StorageClient`] executes [`Operation`]s through a shared pipeline and
//! turns non-success responses into [`StorageError::Service`].  The typed
//! clients in the submodules are thin wrappers that name containers, blobs,
//! file systems, paths and queues.

pub mod blob;
pub mod datalake;
pub mod queue;

use std::sync::Arc;

use reqwest::Url;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{Result, StorageError};
use crate::operations::{Operation, Service};
use crate::pipeline::Pipeline;
use crate::request::{Response, X_MS_ERROR_CODE};
use crate::xml;

pub use blob::{BlobClient, BlobProperties, ContainerClient};
pub use datalake::{FileSystemClient, PathClient};
pub use queue::QueueClient;

/// Root URLs of the blob, data lake and queue services of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub blob: Url,
    pub dfs: Url,
    pub queue: Url,
}

impl ServiceEndpoints {
    /// Public cloud endpoints for `account`.
    pub fn for_account(account: &str, protocol: &str, endpoint_suffix: &str) -> Result<Self> {
        let make = |service: &str| {
            Url::parse(&format!(
                "{}://{}.{}.{}",
                protocol, account, service, endpoint_suffix
            ))
            .map_err(|e| {
                StorageError::invalid_argument(format!("invalid {} endpoint: {}", service, e))
            })
        };
        Ok(Self {
            blob: make("blob")?,
            dfs: make("dfs")?,
            queue: make("queue")?,
        })
    }

    pub fn for_service(&self, service: Service) -> &Url {
        match service {
            Service::Blob => &self.blob,
            Service::Dfs => &self.dfs,
            Service::Queue => &self.queue,
        }
    }
}

/// Executes operations against one account. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StorageClient {
    pipeline: Arc<Pipeline>,
    endpoints: Arc<ServiceEndpoints>,
}

impl StorageClient {
    pub fn new(pipeline: Arc<Pipeline>, endpoints: ServiceEndpoints) -> Self {
        Self {
            pipeline,
            endpoints: Arc::new(endpoints),
        }
    }

    pub fn endpoints(&self) -> &ServiceEndpoints {
        &self.endpoints
    }

    pub fn container(&self, name: &str) -> ContainerClient {
        ContainerClient::new(self.clone(), name)
    }

    pub fn file_system(&self, name: &str) -> FileSystemClient {
        FileSystemClient::new(self.clone(), name)
    }

    pub fn queue(&self, name: &str) -> QueueClient {
        QueueClient::new(self.clone(), name)
    }

    /// Send `op` and return the successful response, or the service error.
    pub async fn execute(&self, op: &Operation, cancel: &CancellationToken) -> Result<Response> {
        let endpoint = self.endpoints.for_service(op.service());
        let mut request = op.to_request(endpoint)?.with_cancel(cancel.clone());
        debug!("{}: {} {}", op.name(), request.method, request.url.path());

        let response = self.pipeline.send(&mut request).await?;
        if response.status.is_success() {
            return Ok(response);
        }
        Err(service_error(response).await)
    }
}

#[derive(Deserialize)]
struct JsonErrorEnvelope {
    error: JsonError,
}

#[derive(Deserialize)]
struct JsonError {
    code: Option<String>,
    message: Option<String>,
}

/// Build a [`StorageError::Service`] from a failed response. The error code
/// comes from `x-ms-error-code`, an XML `<Error>` body or a JSON
/// `{"error": {...}}` body, in that order.
pub async fn service_error(response: Response) -> StorageError {
    let status = response.status;
    let request_id = response.meta().request_id;
    let header_code = response.header(X_MS_ERROR_CODE).map(str::to_string);

    let body = match response.bytes().await {
        Ok(b) => b,
        Err(e) if e.is_cancelled() => return e,
        Err(_) => bytes::Bytes::new(),
    };

    let (body_code, message) = if let Some(err) = xml::parse_error(&body) {
        (err.code, err.message)
    } else if let Ok(env) = serde_json::from_slice::<JsonErrorEnvelope>(&body) {
        (env.error.code, env.error.message)
    } else {
        (None, None)
    };

    let code = header_code
        .or(body_code)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").replace(' ', ""));
    let message = message.unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("service request failed")
            .to_string()
    });

    StorageError::Service {
        status,
        code,
        message,
        request_id,
    }
}
