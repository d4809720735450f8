//! Per-attempt request logging.
//!
//! Sits below the retry policy, so every attempt is logged individually
//! with its attempt number.  Signed query parameters are redacted before a
//! URL reaches the log.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Next, Policy};
use crate::errors::Result;
use crate::metrics::{normalize_path, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::request::{redact_url, Request, Response, X_MS_CLIENT_REQUEST_ID};

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingOptions {
    /// Attempts slower than this are logged at WARN.
    #[serde(default = "default_slow_request_threshold_ms")]
    pub slow_request_threshold_ms: u64,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            slow_request_threshold_ms: default_slow_request_threshold_ms(),
        }
    }
}

fn default_slow_request_threshold_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone)]
pub struct LoggingPolicy {
    slow_threshold: Duration,
}

impl LoggingPolicy {
    pub fn new(options: LoggingOptions) -> Self {
        Self {
            slow_threshold: Duration::from_millis(options.slow_request_threshold_ms),
        }
    }

    async fn run<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> Result<Response> {
        let method = request.method.to_string();
        let path = normalize_path(request.url.path());
        let url = redact_url(&request.url);
        let client_request_id = request
            .header(X_MS_CLIENT_REQUEST_ID)
            .unwrap_or_default()
            .to_string();
        let attempt = request.retry_count;

        debug!(
            "--> {} {} attempt={} client_request_id={}",
            method, url, attempt, client_request_id
        );

        let start = Instant::now();
        let outcome = next.run(request).await;
        let elapsed = start.elapsed();

        let status = match &outcome {
            Ok(resp) => resp.status.as_u16().to_string(),
            Err(e) => e.code().to_string(),
        };
        counter!(REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status)
            .increment(1);
        histogram!(REQUEST_DURATION_SECONDS, "method" => method.clone(), "path" => path)
            .record(elapsed.as_secs_f64());

        match &outcome {
            Ok(resp) if resp.status.is_server_error() => warn!(
                "<-- {} {} {} in {}ms attempt={} request_id={}",
                method,
                url,
                resp.status,
                elapsed.as_millis(),
                attempt,
                resp.meta().request_id.unwrap_or_default()
            ),
            Ok(resp) => debug!(
                "<-- {} {} {} in {}ms attempt={}",
                method,
                url,
                resp.status,
                elapsed.as_millis(),
                attempt
            ),
            Err(e) if e.is_cancelled() => debug!("<-- {} {} cancelled", method, url),
            Err(e) => warn!(
                "<-- {} {} failed after {}ms attempt={}: {}",
                method,
                url,
                elapsed.as_millis(),
                attempt,
                e
            ),
        }

        if elapsed > self.slow_threshold {
            warn!(
                "slow request: {} {} took {}ms (threshold {}ms)",
                method,
                url,
                elapsed.as_millis(),
                self.slow_threshold.as_millis()
            );
        }

        outcome
    }
}

impl Policy for LoggingPolicy {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn send<'a>(
        &'a self,
        request: &'a mut Request,
        next: Next<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        Box::pin(self.run(request, next))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::{Method, StatusCode};
    use reqwest::Url;

    use super::*;
    use crate::credentials::Credential;
    use crate::pipeline::test_support::{Scripted, ScriptedTransport};
    use crate::pipeline::Pipeline;
    use crate::transport::HttpClient;

    #[tokio::test]
    async fn test_logging_passes_outcome_through() {
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Status(500)]));
        let dyn_transport: Arc<dyn HttpClient> = transport.clone();
        let pipeline = Pipeline::new(
            vec![Arc::new(LoggingPolicy::new(LoggingOptions {
                slow_request_threshold_ms: 0,
            }))],
            Credential::Anonymous,
            dyn_transport,
        );
        let mut req = Request::new(
            Method::GET,
            Url::parse("https://acct.blob.core.windows.net/c/b?sig=secret").unwrap(),
        );
        let resp = pipeline.send(&mut req).await.unwrap();
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(transport.calls(), 1);
    }
}
