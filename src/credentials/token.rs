//! Bearer token authorization.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::{Result, StorageError};
use crate::pipeline::{Next, Policy};
use crate::request::{Request, Response};

/// Default scope for storage data-plane tokens.
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

/// Tokens are refreshed once they are this close to expiry.
const REFRESH_WINDOW_SECS: i64 = 120;

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

/// Source of bearer tokens.
pub trait TokenProvider: Send + Sync + 'static {
    fn get_token<'a>(
        &'a self,
        scopes: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>>;
}

/// A fixed token that never expires.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn get_token<'a>(
        &'a self,
        _scopes: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>> {
        Box::pin(async move {
            Ok(AccessToken {
                token: self.token.clone(),
                expires_on: Utc::now() + Duration::days(365 * 100),
            })
        })
    }
}

/// Sets `Authorization: Bearer {token}`, caching the token until it enters
/// the refresh window.
pub struct BearerTokenPolicy {
    provider: Arc<dyn TokenProvider>,
    cache: Mutex<Option<AccessToken>>,
    refresh_window: Duration,
}

impl BearerTokenPolicy {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(None),
            refresh_window: Duration::seconds(REFRESH_WINDOW_SECS),
        }
    }

    async fn token(&self) -> Result<String> {
        // Held across the fetch so concurrent attempts share one refresh.
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.expires_on - self.refresh_window > Utc::now() {
                return Ok(cached.token.clone());
            }
        }
        debug!("bearer token: fetching new token");
        let fresh = self.provider.get_token(&[STORAGE_SCOPE]).await?;
        if fresh.token.is_empty() {
            return Err(StorageError::signature_config(
                "token provider returned an empty token",
            ));
        }
        let token = fresh.token.clone();
        *cache = Some(fresh);
        Ok(token)
    }
}

impl Policy for BearerTokenPolicy {
    fn name(&self) -> &'static str {
        "bearer-token-credential"
    }

    fn send<'a>(
        &'a self,
        request: &'a mut Request,
        next: Next<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        Box::pin(async move {
            let token = self.token().await?;
            request.set_header("authorization", &format!("Bearer {}", token))?;
            next.run(request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        lifetime: Duration,
    }

    impl TokenProvider for CountingProvider {
        fn get_token<'a>(
            &'a self,
            _scopes: &'a [&'a str],
        ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(AccessToken {
                    token: format!("token-{}", n),
                    expires_on: Utc::now() + self.lifetime,
                })
            })
        }
    }

    #[tokio::test]
    async fn test_token_cached_until_refresh_window() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            lifetime: Duration::hours(1),
        });
        let policy = BearerTokenPolicy::new(provider.clone());
        assert_eq!(policy.token().await.unwrap(), "token-1");
        assert_eq!(policy.token().await.unwrap(), "token-1");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_refreshed_inside_window() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            lifetime: Duration::seconds(30),
        });
        let policy = BearerTokenPolicy::new(provider.clone());
        assert_eq!(policy.token().await.unwrap(), "token-1");
        assert_eq!(policy.token().await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn test_bearer_header_reaches_transport_and_refreshes_on_retry() {
        use crate::credentials::Credential;
        use crate::pipeline::test_support::{Scripted, ScriptedTransport};
        use crate::pipeline::{new_pipeline, PipelineOptions, RetryOptions};
        use http::Method;
        use reqwest::Url;

        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Status(503),
            Scripted::Status(201),
        ]));
        // 30s lifetime is inside the refresh window, so every attempt fetches.
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            lifetime: Duration::seconds(30),
        });
        let options = PipelineOptions {
            retry: RetryOptions {
                max_tries: 3,
                retry_delay_ms: 1,
                max_retry_delay_ms: 2,
                ..RetryOptions::default()
            },
            http_client: Some(transport.clone()),
            ..PipelineOptions::default()
        };
        let pipeline = new_pipeline(Credential::token(provider.clone()), options).unwrap();

        let mut req = Request::new(
            Method::GET,
            Url::parse("https://acct.blob.core.windows.net/photos/cat.jpg").unwrap(),
        );
        let resp = pipeline.send(&mut req).await.unwrap();
        assert_eq!(resp.status, http::StatusCode::CREATED);

        let seen = transport.requests();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].header("authorization"), Some("Bearer token-1"));
        assert_eq!(seen[1].header("authorization"), Some("Bearer token-2"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_static_provider() {
        let policy = BearerTokenPolicy::new(Arc::new(StaticTokenProvider::new("abc")));
        assert_eq!(policy.token().await.unwrap(), "abc");
        let empty = BearerTokenPolicy::new(Arc::new(StaticTokenProvider::new("")));
        assert_eq!(empty.token().await.unwrap_err().code(), "SignatureConfigError");
    }
}
