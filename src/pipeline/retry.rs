//! Retry policy.
//!
//! Per logical request the policy runs `Attempt(1..=max_tries)`.  Each
//! attempt re-enters the chain below it (logging, then credential), so every
//! attempt is logged and freshly signed.  Outcomes are classified as:
//!
//! * success or a non-retryable status: returned as-is;
//! * network error, per-try timeout, 5xx, 408 or 429: retried while
//!   attempts remain, after a backoff delay;
//! * cancellation: returned immediately, never retried.
//!
//! When a secondary host is configured, GET and HEAD requests alternate
//! between primary (odd attempts) and secondary (even attempts). A 404 from
//! the secondary means the data has not replicated yet; later attempts then
//! stay on the primary.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use http::{Method, StatusCode};
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Next, Policy};
use crate::errors::{is_retryable_status, Result, StorageError};
use crate::metrics::RETRIES_TOTAL;
use crate::request::{Request, Response};

/// Backoff flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicyType {
    /// `retry_delay * 2^(attempt-1)`, capped at `max_retry_delay`, jittered.
    #[default]
    Exponential,
    /// Constant `retry_delay` between attempts.
    Fixed,
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryOptions {
    /// Total attempts including the first one. Must be at least 1.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Timeout for a single attempt. Unset means no client-side limit.
    #[serde(default)]
    pub try_timeout_ms: Option<u64>,

    /// Base delay between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound for the computed delay.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    #[serde(default)]
    pub policy_type: RetryPolicyType,

    /// Read-only replica host used for GET/HEAD retries.
    #[serde(default)]
    pub secondary_host: Option<String>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            try_timeout_ms: None,
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            policy_type: RetryPolicyType::default(),
            secondary_host: None,
        }
    }
}

fn default_max_tries() -> u32 {
    4
}

fn default_retry_delay_ms() -> u64 {
    4_000
}

fn default_max_retry_delay_ms() -> u64 {
    120_000
}

impl RetryOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_tries == 0 {
            return Err(StorageError::invalid_argument(
                "retry.max_tries must be at least 1",
            ));
        }
        if self.retry_delay_ms > self.max_retry_delay_ms {
            return Err(StorageError::invalid_argument(format!(
                "retry.retry_delay_ms ({}) must not exceed retry.max_retry_delay_ms ({})",
                self.retry_delay_ms, self.max_retry_delay_ms
            )));
        }
        if self.try_timeout_ms == Some(0) {
            return Err(StorageError::invalid_argument(
                "retry.try_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Un-jittered exponential delay for the retry after attempt `attempt`
/// (1-based): `min(max, base * 2^(attempt-1))`.
pub fn exponential_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(multiplier).min(max)
}

/// Apply +/-20% jitter, never exceeding `max`.
fn jitter(delay: Duration, max: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor).min(max)
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// Delay to wait after attempt `attempt` failed.
    pub fn delay_after(&self, attempt: u32, primary: bool) -> Duration {
        if !primary {
            // The secondary is a different endpoint; no need to back off from it.
            return Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        }
        let base = Duration::from_millis(self.options.retry_delay_ms);
        let max = Duration::from_millis(self.options.max_retry_delay_ms);
        match self.options.policy_type {
            RetryPolicyType::Exponential => jitter(exponential_delay(attempt, base, max), max),
            RetryPolicyType::Fixed => base,
        }
    }

    fn secondary_eligible(&self, method: &Method) -> bool {
        self.options
            .secondary_host
            .as_deref()
            .map_or(false, |h| !h.is_empty())
            && (method == Method::GET || method == Method::HEAD)
    }

    async fn run<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> Result<Response> {
        let primary_url = request.url.clone();
        let try_timeout = self.options.try_timeout_ms.map(Duration::from_millis);
        let secondary_eligible = self.secondary_eligible(&request.method);
        let mut secondary_has_data = true;
        let mut attempt: u32 = 1;

        loop {
            if request.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let primary = !(secondary_eligible && secondary_has_data && attempt % 2 == 0);
            request.url = primary_url.clone();
            if !primary {
                if let Some(host) = self.options.secondary_host.as_deref() {
                    if let Err(e) = request.url.set_host(Some(host)) {
                        warn!("invalid secondary host {}: {}", host, e);
                    }
                }
            }
            request.retry_count = attempt;
            request.try_timeout = try_timeout;

            let outcome = match try_timeout {
                Some(limit) => match tokio::time::timeout(limit, next.run(&mut *request)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(StorageError::Timeout { after: limit }),
                },
                None => next.run(&mut *request).await,
            };

            let retry = match &outcome {
                Ok(resp) => {
                    if !primary && resp.status == StatusCode::NOT_FOUND {
                        secondary_has_data = false;
                        true
                    } else {
                        is_retryable_status(resp.status)
                    }
                }
                Err(e) if e.is_cancelled() => return Err(StorageError::Cancelled),
                Err(e) => e.is_retryable(),
            };

            if !retry || attempt >= self.options.max_tries {
                if retry {
                    debug!(
                        "retry: giving up after {} attempts on {} {}",
                        attempt,
                        request.method,
                        request.url.path()
                    );
                }
                return outcome;
            }

            let delay = self.delay_after(attempt, primary);
            match &outcome {
                Ok(resp) => warn!(
                    "retry: attempt {} of {} {} returned {}; retrying in {}ms",
                    attempt,
                    request.method,
                    request.url.path(),
                    resp.status,
                    delay.as_millis()
                ),
                Err(e) => warn!(
                    "retry: attempt {} of {} {} failed: {}; retrying in {}ms",
                    attempt,
                    request.method,
                    request.url.path(),
                    e,
                    delay.as_millis()
                ),
            }
            // Discard the failed response (and its body) before waiting.
            drop(outcome);
            metrics::counter!(RETRIES_TOTAL).increment(1);

            tokio::select! {
                _ = request.cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

impl Policy for RetryPolicy {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn send<'a>(
        &'a self,
        request: &'a mut Request,
        next: Next<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        Box::pin(self.run(request, next))
    }
}
