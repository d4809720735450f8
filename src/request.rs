//! Request and response types shared by the pipeline, the transport and
//! the operation layer.
//!
//! Headers live in an [`http::HeaderMap`], which gives case-insensitive,
//! normalized names.  Request bodies are [`Bytes`] so that a retried
//! attempt can re-send the same payload without copying it.

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, StorageError};

// -- Header names -------------------------------------------------------------

pub const X_MS_DATE: &str = "x-ms-date";
pub const X_MS_VERSION: &str = "x-ms-version";
pub const X_MS_CLIENT_REQUEST_ID: &str = "x-ms-client-request-id";
pub const X_MS_REQUEST_ID: &str = "x-ms-request-id";
pub const X_MS_ERROR_CODE: &str = "x-ms-error-code";
pub const X_MS_CONTINUATION: &str = "x-ms-continuation";
pub const X_MS_RANGE: &str = "x-ms-range";

/// A byte range `[offset, offset + count)`; `count == None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub count: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, count: Option<u64>) -> Self {
        Self { offset, count }
    }

    /// Render as an HTTP range header value (`bytes=0-1023`, `bytes=512-`).
    pub fn to_header_value(&self) -> String {
        match self.count {
            Some(count) if count > 0 => {
                format!("bytes={}-{}", self.offset, self.offset + count - 1)
            }
            _ => format!("bytes={}-", self.offset),
        }
    }
}

// -- Request ------------------------------------------------------------------

/// An outgoing HTTP request travelling down the policy chain.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Cancellation signal of the top-level call this request belongs to.
    pub cancel: CancellationToken,
    /// Number of attempts already made for this logical request. Updated in
    /// place by the retry policy.
    pub retry_count: u32,
    /// Per-attempt timeout applied by the retry policy.
    pub try_timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            cancel: CancellationToken::new(),
            retry_count: 0,
            try_timeout: None,
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Insert or replace a header. Invalid names or values are rejected.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StorageError::invalid_argument(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            StorageError::invalid_argument(format!("invalid value for header {name}: {e}"))
        })?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Header value as a string, or `None` when absent or not visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Short description used in logs and diagnostics, with SAS signatures
    /// removed from the URL.
    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            method: self.method.clone(),
            url: redact_url(&self.url),
            client_request_id: self.header(X_MS_CLIENT_REQUEST_ID).map(str::to_string),
        }
    }
}

/// Diagnostic back-reference from a response to its originating request.
#[derive(Debug, Clone, Default)]
pub struct RequestSummary {
    pub method: Method,
    pub url: String,
    pub client_request_id: Option<String>,
}

/// Render `url` with the values of `sig` replaced, so signed URLs can be
/// logged.
pub fn redact_url(url: &Url) -> String {
    if url.query().is_none() {
        return url.to_string();
    }
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if k.eq_ignore_ascii_case("sig") {
                (k.into_owned(), "*****".to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

// -- Response -----------------------------------------------------------------

/// Response body: fully buffered, or a stream of byte chunks.
pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(BoxStream<'static, Result<Bytes>>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            ResponseBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// A response produced by the transport and passed back up the chain.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub request: RequestSummary,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Buffered(body),
            request: RequestSummary::default(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Typed view over the headers the core understands.
    pub fn meta(&self) -> ResponseMeta {
        ResponseMeta::from_headers(&self.headers)
    }

    /// Collect the whole body into memory.
    pub async fn bytes(self) -> Result<Bytes> {
        match self.body {
            ResponseBody::Buffered(b) => Ok(b),
            ResponseBody::Streaming(mut s) => {
                let mut buf = BytesMut::new();
                while let Some(piece) = s.next().await {
                    buf.extend_from_slice(&piece?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Collect the body as UTF-8 text (lossy).
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Turn the body into a stream regardless of how it was produced.
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        match self.body {
            ResponseBody::Buffered(b) if b.is_empty() => stream::empty().boxed(),
            ResponseBody::Buffered(b) => stream::once(async move { Ok(b) }).boxed(),
            ResponseBody::Streaming(s) => s,
        }
    }
}

/// Headers surfaced to callers of typed operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<u64>,
    pub continuation: Option<String>,
    pub request_id: Option<String>,
    pub client_request_id: Option<String>,
}

impl ResponseMeta {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            etag: get("etag"),
            last_modified: get("last-modified"),
            content_length: get("content-length").and_then(|v| v.parse().ok()),
            continuation: get(X_MS_CONTINUATION).filter(|v| !v.is_empty()),
            request_id: get(X_MS_REQUEST_ID),
            client_request_id: get(X_MS_CLIENT_REQUEST_ID),
        }
    }
}
