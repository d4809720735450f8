//! Request credentials.
//!
//! A [`Credential`] is turned into exactly one credential policy which the
//! pipeline always runs last, right before the transport.  Supported
//! schemes:
//!
//! - anonymous (no authorization)
//! - Shared Key (HMAC-SHA256 over the canonical request, see [`shared_key`])
//! - SAS token (query parameters merged into every request URL)
//! - bearer token from a [`TokenProvider`] (cached until close to expiry)

pub mod shared_key;
pub mod token;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::errors::{Result, StorageError};
use crate::pipeline::{Next, Policy};
use crate::request::{Request, Response};

pub use shared_key::{SharedKeyCredential, SharedKeyCredentialPolicy};
pub use token::{AccessToken, BearerTokenPolicy, StaticTokenProvider, TokenProvider};

/// How requests are authorized.
#[derive(Clone, Default)]
pub enum Credential {
    #[default]
    Anonymous,
    SharedKey(SharedKeyCredential),
    Sas(SasCredential),
    Token(Arc<dyn TokenProvider>),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material or tokens.
        match self {
            Credential::Anonymous => f.write_str("Anonymous"),
            Credential::SharedKey(c) => write!(f, "SharedKey({})", c.account_name()),
            Credential::Sas(_) => f.write_str("Sas(*****)"),
            Credential::Token(_) => f.write_str("Token(*****)"),
        }
    }
}

impl Credential {
    /// Shared Key credential from an account name and base64 account key.
    pub fn shared_key(account: &str, key: &str) -> Result<Self> {
        Ok(Credential::SharedKey(SharedKeyCredential::new(account, key)?))
    }

    /// SAS credential from a token string, with or without a leading `?`.
    pub fn sas(token: &str) -> Result<Self> {
        Ok(Credential::Sas(SasCredential::new(token)?))
    }

    /// Bearer token credential.
    pub fn token(provider: Arc<dyn TokenProvider>) -> Self {
        Credential::Token(provider)
    }

    /// Build the policy that applies this credential to each attempt.
    pub fn into_policy(self) -> Arc<dyn Policy> {
        match self {
            Credential::Anonymous => Arc::new(AnonymousCredentialPolicy),
            Credential::SharedKey(c) => Arc::new(SharedKeyCredentialPolicy::new(c)),
            Credential::Sas(c) => Arc::new(SasCredentialPolicy::new(c)),
            Credential::Token(p) => Arc::new(BearerTokenPolicy::new(p)),
        }
    }
}

// -- Anonymous ----------------------------------------------------------------

/// Passes requests through untouched.
#[derive(Debug, Clone, Copy)]
pub struct AnonymousCredentialPolicy;

impl Policy for AnonymousCredentialPolicy {
    fn name(&self) -> &'static str {
        "anonymous-credential"
    }

    fn send<'a>(
        &'a self,
        request: &'a mut Request,
        next: Next<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        next.run(request)
    }
}

// -- SAS ----------------------------------------------------------------------

/// A shared access signature: already-encoded `name=value` query pairs.
#[derive(Clone)]
pub struct SasCredential {
    pairs: Vec<(String, String)>,
}

impl SasCredential {
    pub fn new(token: &str) -> Result<Self> {
        let token = token.strip_prefix('?').unwrap_or(token);
        let pairs: Vec<(String, String)> = token
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (p.to_string(), String::new()),
            })
            .collect();
        if pairs.is_empty() {
            return Err(StorageError::signature_config("SAS token is empty"));
        }
        if !pairs.iter().any(|(k, _)| k == "sig") {
            return Err(StorageError::signature_config(
                "SAS token has no 'sig' parameter",
            ));
        }
        Ok(Self { pairs })
    }

    /// Append every SAS parameter not already present on `url`.
    pub fn apply(&self, url: &mut reqwest::Url) {
        let existing: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        let mut query = url.query().unwrap_or_default().to_string();
        for (k, v) in &self.pairs {
            if existing.iter().any(|e| e == k) {
                continue;
            }
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(k);
            query.push('=');
            query.push_str(v);
        }
        url.set_query(Some(&query));
    }
}

#[derive(Clone)]
pub struct SasCredentialPolicy {
    credential: SasCredential,
}

impl SasCredentialPolicy {
    pub fn new(credential: SasCredential) -> Self {
        Self { credential }
    }
}

impl Policy for SasCredentialPolicy {
    fn name(&self) -> &'static str {
        "sas-credential"
    }

    fn send<'a>(
        &'a self,
        request: &'a mut Request,
        next: Next<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        self.credential.apply(&mut request.url);
        next.run(request)
    }
}
