//! Unique request id policy.
//!
//! Sits above the retry policy, so one logical operation keeps the same
//! `x-ms-client-request-id` across every attempt.

use std::future::Future;
use std::pin::Pin;

use http::header::HeaderValue;

use super::{Next, Policy};
use crate::errors::Result;
use crate::request::{Request, Response, X_MS_CLIENT_REQUEST_ID};

#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueRequestIdPolicy;

impl Policy for UniqueRequestIdPolicy {
    fn name(&self) -> &'static str {
        "unique-request-id"
    }

    fn send<'a>(
        &'a self,
        request: &'a mut Request,
        next: Next<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        if !request.headers.contains_key(X_MS_CLIENT_REQUEST_ID) {
            let id = uuid::Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                request.headers.insert(X_MS_CLIENT_REQUEST_ID, value);
            }
        }
        next.run(request)
    }
}
