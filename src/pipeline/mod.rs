//! Request pipeline.
//!
//! A [`Pipeline`] is an immutable, ordered chain of [`Policy`] stages in
//! front of an [`HttpClient`].  Each policy receives the request and a
//! [`Next`] handle for the remainder of the chain, so it can mutate the
//! request, call further down (possibly several times, as the retry policy
//! does) and inspect the response on the way back up.
//!
//! [`new_pipeline`] builds the standard chain:
//!
//! ```text
//! keep-alive -> telemetry -> unique request id -> retry -> logging -> credential -> transport
//! ```
//!
//! The credential policy is not part of the general policy list: it is a
//! distinguished argument of [`Pipeline::new`] and always runs last, so the
//! signature covers every header injected above it and every retried
//! attempt is re-signed.

pub mod keep_alive;
pub mod logging;
pub mod request_id;
pub mod retry;
pub mod telemetry;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;

use crate::credentials::Credential;
use crate::errors::Result;
use crate::request::{Request, Response};
use crate::transport::{HttpClient, ReqwestClient};

pub use keep_alive::{KeepAliveOptions, KeepAlivePolicy};
pub use logging::{LoggingOptions, LoggingPolicy};
pub use request_id::UniqueRequestIdPolicy;
pub use retry::{RetryOptions, RetryPolicy, RetryPolicyType};
pub use telemetry::{TelemetryOptions, TelemetryPolicy};

/// One stage of the request pipeline.
pub trait Policy: Send + Sync + 'static {
    /// Short stable name, used in logs and to inspect pipeline order.
    fn name(&self) -> &'static str;

    /// Process `request`, delegating to `next` for the rest of the chain.
    fn send<'a>(
        &'a self,
        request: &'a mut Request,
        next: Next<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;
}

/// The remainder of the chain below the current policy.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    policies: &'a [Arc<dyn Policy>],
    transport: &'a dyn HttpClient,
}

impl<'a> Next<'a> {
    /// Run the remaining policies and finally the transport.
    pub fn run<'b>(
        self,
        request: &'b mut Request,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'b>>
    where
        'a: 'b,
    {
        match self.policies.split_first() {
            Some((policy, rest)) => policy.send(
                request,
                Next {
                    policies: rest,
                    transport: self.transport,
                },
            ),
            None => self.transport.send(request),
        }
    }
}

/// Options accepted by [`new_pipeline`].
#[derive(Clone, Default, Deserialize)]
pub struct PipelineOptions {
    #[serde(default)]
    pub telemetry: TelemetryOptions,
    #[serde(default)]
    pub retry: RetryOptions,
    #[serde(default)]
    pub keep_alive: KeepAliveOptions,
    #[serde(default)]
    pub logging: LoggingOptions,
    /// Custom transport; a pooled reqwest client is used when unset.
    #[serde(skip)]
    pub http_client: Option<Arc<dyn HttpClient>>,
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("telemetry", &self.telemetry)
            .field("retry", &self.retry)
            .field("keep_alive", &self.keep_alive)
            .field("logging", &self.logging)
            .field("http_client", &self.http_client.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Immutable ordered policy chain plus transport. Cheap to share behind an
/// `Arc` across any number of concurrent operations.
pub struct Pipeline {
    policies: Vec<Arc<dyn Policy>>,
    transport: Arc<dyn HttpClient>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("policies", &self.policy_names())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Compose `policies` (outermost first) with `credential` as the final
    /// stage before `transport`.
    pub fn new(
        policies: Vec<Arc<dyn Policy>>,
        credential: Credential,
        transport: Arc<dyn HttpClient>,
    ) -> Self {
        let mut policies = policies;
        policies.push(credential.into_policy());
        Self {
            policies,
            transport,
        }
    }

    /// Send `request` through every policy and the transport.
    pub async fn send(&self, request: &mut Request) -> Result<Response> {
        Next {
            policies: &self.policies,
            transport: self.transport.as_ref(),
        }
        .run(request)
        .await
    }

    /// Policy names in execution order.
    pub fn policy_names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|p| p.name()).collect()
    }
}

/// Build the standard pipeline for `credential`.
pub fn new_pipeline(credential: Credential, options: PipelineOptions) -> Result<Pipeline> {
    options.retry.validate()?;

    let transport: Arc<dyn HttpClient> = match options.http_client {
        Some(client) => client,
        None => Arc::new(ReqwestClient::new(options.keep_alive.enable)?),
    };

    // Closer to the API first, closer to the wire last.
    let policies: Vec<Arc<dyn Policy>> = vec![
        Arc::new(KeepAlivePolicy::new(options.keep_alive)),
        Arc::new(TelemetryPolicy::new(&options.telemetry)),
        Arc::new(UniqueRequestIdPolicy),
        Arc::new(RetryPolicy::new(options.retry)),
        Arc::new(LoggingPolicy::new(options.logging)),
    ];

    Ok(Pipeline::new(policies, credential, transport))
}
