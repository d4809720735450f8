//! HTTP transport boundary.
//!
//! The pipeline consumes exactly one capability from the network layer:
//! send a [`Request`] and hand back a [`Response`].  [`ReqwestClient`] is
//! the default implementation; tests swap in scripted or replaying
//! transports.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tracing::debug;

use crate::errors::{Result, StorageError};
use crate::request::{Request, Response, ResponseBody};

/// The innermost stage of every pipeline.
pub trait HttpClient: Send + Sync + 'static {
    /// Send `request` once. Implementations must observe `request.cancel`
    /// and return [`StorageError::Cancelled`] when it fires.
    fn send<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;
}

/// Transport backed by a shared `reqwest::Client` connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Build a client. With `keep_alive == false` idle connections are not
    /// pooled.
    pub fn new(keep_alive: bool) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(30));
        if !keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        let client = builder
            .build()
            .map_err(|e| StorageError::Internal(anyhow::anyhow!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpClient for ReqwestClient {
    fn send<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        Box::pin(async move {
            if request.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let req = self
                .client
                .request(request.method.clone(), request.url.clone())
                .headers(request.headers.clone())
                .body(request.body.clone());

            let resp = tokio::select! {
                _ = request.cancel.cancelled() => return Err(StorageError::Cancelled),
                resp = req.send() => resp.map_err(|e| StorageError::network(format!("request failed: {}", e)))?,
            };

            let status = resp.status();
            let headers = resp.headers().clone();
            debug!("transport: {} {} -> {}", request.method, request.url.path(), status);

            let body = Box::pin(resp.bytes_stream());
            let cancel = request.cancel.clone();
            let stream = stream::unfold(Some((body, cancel)), |state| async move {
                let (mut body, cancel) = state?;
                let piece = tokio::select! {
                    _ = cancel.cancelled() => return Some((Err(StorageError::Cancelled), None)),
                    piece = body.next() => piece,
                };
                piece.map(|p| {
                    let p = p.map_err(|e| StorageError::network(format!("body read failed: {}", e)));
                    (p, Some((body, cancel)))
                })
            })
            .boxed();

            Ok(Response {
                status,
                headers,
                body: ResponseBody::Streaming(stream),
                request: request.summary(),
            })
        })
    }
}
