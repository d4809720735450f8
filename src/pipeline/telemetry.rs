//! Telemetry policy: stamps every request with a `User-Agent` describing
//! this SDK, optionally prefixed by an application-supplied value.

use std::future::Future;
use std::pin::Pin;

use http::header::{HeaderValue, USER_AGENT};
use serde::Deserialize;

use super::{Next, Policy};
use crate::errors::Result;
use crate::request::{Request, Response};

/// Telemetry configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryOptions {
    /// Prepended to the SDK user agent, e.g. `"my-app/1.2"`.
    #[serde(default)]
    pub user_agent_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelemetryPolicy {
    user_agent: HeaderValue,
}

impl TelemetryPolicy {
    pub fn new(options: &TelemetryOptions) -> Self {
        let value = user_agent(options.user_agent_prefix.as_deref());
        // Fall back to the bare SDK token if the prefix is not a valid header value.
        let user_agent = HeaderValue::from_str(&value)
            .unwrap_or_else(|_| HeaderValue::from_static(concat!("azsdk-rust-azstore/", env!("CARGO_PKG_VERSION"))));
        Self { user_agent }
    }
}

/// `[{prefix} ]azsdk-rust-azstore/{version} ({os}; {arch})`
pub fn user_agent(prefix: Option<&str>) -> String {
    let sdk = format!(
        "azsdk-rust-azstore/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    match prefix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{} {}", prefix, sdk),
        None => sdk,
    }
}

impl Policy for TelemetryPolicy {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    fn send<'a>(
        &'a self,
        request: &'a mut Request,
        next: Next<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        if !request.headers.contains_key(USER_AGENT) {
            request.headers.insert(USER_AGENT, self.user_agent.clone());
        }
        next.run(request)
    }
}
