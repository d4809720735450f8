//! Shared Key authorization.
//!
//! The string-to-sign format:
//! ```text
//! VERB\n
//! Content-Encoding\n
//! Content-Language\n
//! Content-Length\n
//! Content-MD5\n
//! Content-Type\n
//! Date\n
//! If-Modified-Since\n
//! If-Match\n
//! If-None-Match\n
//! If-Unmodified-Since\n
//! Range\n
//! CanonicalizedHeaders
//! CanonicalizedResource
//! ```
//!
//! Canonicalized headers are all `x-ms-*` headers, lowercased and sorted,
//! each rendered as `name:value\n`.  The canonicalized resource is
//! `/{account}{path}` followed by one `\n{name}:{values}` line per query
//! parameter (names lowercased and sorted, decoded values sorted and
//! comma-joined).

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use http::header::{
    HeaderName, CONTENT_ENCODING, CONTENT_LANGUAGE, CONTENT_LENGTH, CONTENT_TYPE, DATE, IF_MATCH,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE, RANGE,
};
use sha2::Sha256;

use crate::errors::{Result, StorageError};
use crate::pipeline::{Next, Policy};
use crate::request::{Request, Response, X_MS_DATE};

type HmacSha256 = Hmac<Sha256>;

/// Account name plus decoded account key.
#[derive(Clone)]
pub struct SharedKeyCredential {
    account: String,
    key_bytes: Vec<u8>,
}

impl SharedKeyCredential {
    /// `key` is the base64 account key as shown in the portal.
    pub fn new(account: &str, key: &str) -> Result<Self> {
        if account.is_empty() {
            return Err(StorageError::signature_config("account name is empty"));
        }
        if key.is_empty() {
            return Err(StorageError::signature_config("account key is empty"));
        }
        let key_bytes = BASE64_STANDARD.decode(key.trim()).map_err(|e| {
            StorageError::signature_config(format!("account key is not valid base64: {}", e))
        })?;
        Ok(Self {
            account: account.to_string(),
            key_bytes,
        })
    }

    pub fn account_name(&self) -> &str {
        &self.account
    }

    /// Build the canonical string for `request` as it currently stands.
    pub fn string_to_sign(&self, request: &Request) -> String {
        let header = |name: &HeaderName| -> String {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        // Content-Length: empty for 0 (GET/DELETE/HEAD and empty PUTs).
        let content_length = match request.headers.get(CONTENT_LENGTH) {
            Some(v) => v.to_str().unwrap_or_default().to_string(),
            None => request.body.len().to_string(),
        };
        let content_length = if content_length == "0" {
            String::new()
        } else {
            content_length
        };

        let mut out = String::new();
        out.push_str(request.method.as_str());
        out.push('\n');
        for value in [
            header(&CONTENT_ENCODING),
            header(&CONTENT_LANGUAGE),
            content_length,
            header(&HeaderName::from_static("content-md5")),
            header(&CONTENT_TYPE),
            header(&DATE),
            header(&IF_MODIFIED_SINCE),
            header(&IF_MATCH),
            header(&IF_NONE_MATCH),
            header(&IF_UNMODIFIED_SINCE),
            header(&RANGE),
        ] {
            out.push_str(&value);
            out.push('\n');
        }
        out.push_str(&self.canonicalized_headers(request));
        out.push_str(&self.canonicalized_resource(request));
        out
    }

    fn canonicalized_headers(&self, request: &Request) -> String {
        let mut ms_headers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, value) in request.headers.iter() {
            let name = name.as_str();
            if name.starts_with("x-ms-") {
                ms_headers
                    .entry(name)
                    .or_default()
                    .push(value.to_str().unwrap_or_default().trim());
            }
        }
        ms_headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.join(",")))
            .collect()
    }

    fn canonicalized_resource(&self, request: &Request) -> String {
        let path = match request.url.path() {
            "" => "/",
            p => p,
        };
        let mut resource = format!("/{}{}", self.account, path);

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (k, v) in request.url.query_pairs() {
            params
                .entry(k.to_lowercase())
                .or_default()
                .push(v.into_owned());
        }
        for (k, mut values) in params {
            values.sort();
            resource.push_str(&format!("\n{}:{}", k, values.join(",")));
        }
        resource
    }

    /// HMAC-SHA256 `string_to_sign` with the account key, base64 encoded.
    pub fn sign(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key_bytes)
            .map_err(|e| StorageError::signature_config(format!("HMAC key error: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// `SharedKey {account}:{signature}` for `request`.
    pub fn authorization(&self, request: &Request) -> Result<String> {
        let signature = self.sign(&self.string_to_sign(request))?;
        Ok(format!("SharedKey {}:{}", self.account, signature))
    }
}

/// Stamps `x-ms-date` and signs every attempt.
#[derive(Clone)]
pub struct SharedKeyCredentialPolicy {
    credential: SharedKeyCredential,
}

impl SharedKeyCredentialPolicy {
    pub fn new(credential: SharedKeyCredential) -> Self {
        Self { credential }
    }

    fn sign_request(&self, request: &mut Request) -> Result<()> {
        let date = httpdate::fmt_http_date(SystemTime::now());
        request.set_header(X_MS_DATE, &date)?;
        let auth = self.credential.authorization(request)?;
        request.set_header("authorization", &auth)
    }
}

impl Policy for SharedKeyCredentialPolicy {
    fn name(&self) -> &'static str {
        "shared-key-credential"
    }

    fn send<'a>(
        &'a self,
        request: &'a mut Request,
        next: Next<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        Box::pin(async move {
            self.sign_request(request)?;
            next.run(request).await
        })
    }
}
