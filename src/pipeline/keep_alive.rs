//! Keep-alive policy.
//!
//! Connection reuse is a transport concern; this policy only marks
//! individual requests with `Connection: close` when keep-alive has been
//! disabled, so the server tears the connection down after answering.

use std::future::Future;
use std::pin::Pin;

use http::header::{HeaderValue, CONNECTION};
use serde::Deserialize;

use super::{Next, Policy};
use crate::errors::Result;
use crate::request::{Request, Response};

/// Keep-alive configuration. Keep-alive is enabled by default.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct KeepAliveOptions {
    #[serde(default = "default_true")]
    pub enable: bool,
}

impl Default for KeepAliveOptions {
    fn default() -> Self {
        Self { enable: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct KeepAlivePolicy {
    enable: bool,
}

impl KeepAlivePolicy {
    pub fn new(options: KeepAliveOptions) -> Self {
        Self {
            enable: options.enable,
        }
    }
}

impl Policy for KeepAlivePolicy {
    fn name(&self) -> &'static str {
        "keep-alive"
    }

    fn send<'a>(
        &'a self,
        request: &'a mut Request,
        next: Next<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        if !self.enable {
            request
                .headers
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }
        next.run(request)
    }
}
