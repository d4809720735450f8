//! Storage client error types.
//!
//! Every failure surfaced by the pipeline, the transfer engine or the
//! recursive ACL engine is a [`StorageError`].  The retry policy is the
//! only component that inspects [`StorageError::is_retryable`]; everything
//! else propagates errors unchanged.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Storage client errors expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The transport failed before a response was received.
    #[error("network error: {message}")]
    Network { message: String },

    /// A single attempt exceeded the per-try timeout.
    #[error("request attempt timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    /// The service answered with a non-success status.
    #[error("service error {status} ({code}): {message}")]
    Service {
        status: StatusCode,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    /// The caller cancelled the operation.
    #[error("The operation was aborted.")]
    Cancelled,

    /// A chunk body ended before (or after) the expected number of bytes.
    #[error("stream ended unexpectedly: expected {expected} bytes, received {received}")]
    StreamIntegrity { expected: u64, received: u64 },

    /// The credential could not be constructed or used for signing.
    #[error("invalid credential configuration: {message}")]
    SignatureConfig { message: String },

    /// An option or argument is out of range.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// A recursive ACL change failed at the request level. The token is the
    /// last continuation token that was successfully processed, if any.
    #[error("recursive access control change failed: {source}")]
    AclChangeFailed {
        #[source]
        source: Box<StorageError>,
        continuation_token: Option<String>,
    },

    /// Catch-all for unexpected internal errors (I/O, decoding).
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StorageError {
    pub fn network(message: impl Into<String>) -> Self {
        StorageError::Network {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        StorageError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn signature_config(message: impl Into<String>) -> Self {
        StorageError::SignatureConfig {
            message: message.into(),
        }
    }

    /// Return a stable short error code string.
    pub fn code(&self) -> &str {
        match self {
            StorageError::Network { .. } => "NetworkError",
            StorageError::Timeout { .. } => "Timeout",
            StorageError::Service { code, .. } => code.as_str(),
            StorageError::Cancelled => "AbortError",
            StorageError::StreamIntegrity { .. } => "StreamIntegrityError",
            StorageError::SignatureConfig { .. } => "SignatureConfigError",
            StorageError::InvalidArgument { .. } => "InvalidArgument",
            StorageError::AclChangeFailed { source, .. } => source.code(),
            StorageError::Internal(_) => "InternalError",
        }
    }

    /// HTTP status carried by a service error, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            StorageError::Service { status, .. } => Some(*status),
            StorageError::AclChangeFailed { source, .. } => source.status_code(),
            _ => None,
        }
    }

    /// Service request id, if the failure came back from the service.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            StorageError::Service { request_id, .. } => request_id.as_deref(),
            StorageError::AclChangeFailed { source, .. } => source.request_id(),
            _ => None,
        }
    }

    /// Whether the retry policy may re-issue the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Network { .. } | StorageError::Timeout { .. } => true,
            StorageError::Service { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Whether this error (or the error it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            StorageError::Cancelled => true,
            StorageError::AclChangeFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Statuses the retry policy treats as transient: every 5xx, 408 and 429.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(status: u16) -> StorageError {
        StorageError::Service {
            status: StatusCode::from_u16(status).unwrap(),
            code: "X".to_string(),
            message: "m".to_string(),
            request_id: Some("req-1".to_string()),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StorageError::network("reset").is_retryable());
        assert!(StorageError::Timeout {
            after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(service(500).is_retryable());
        assert!(service(503).is_retryable());
        assert!(service(408).is_retryable());
        assert!(service(429).is_retryable());
        assert!(!service(404).is_retryable());
        assert!(!service(403).is_retryable());
        assert!(!StorageError::Cancelled.is_retryable());
        assert!(!StorageError::StreamIntegrity {
            expected: 10,
            received: 3
        }
        .is_retryable());
        assert!(!StorageError::signature_config("bad key").is_retryable());
    }

    #[test]
    fn test_codes_and_context() {
        let err = service(409);
        assert_eq!(err.code(), "X");
        assert_eq!(err.status_code(), Some(StatusCode::CONFLICT));
        assert_eq!(err.request_id(), Some("req-1"));
        assert_eq!(StorageError::Cancelled.code(), "AbortError");
        assert_eq!(
            StorageError::Cancelled.to_string(),
            "The operation was aborted."
        );
    }

    #[test]
    fn test_acl_failure_wraps_source() {
        let err = StorageError::AclChangeFailed {
            source: Box::new(service(403)),
            continuation_token: Some("tok".to_string()),
        };
        assert_eq!(err.status_code(), Some(StatusCode::FORBIDDEN));
        assert_eq!(err.request_id(), Some("req-1"));
        assert!(!err.is_cancelled());

        let cancelled = StorageError::AclChangeFailed {
            source: Box::new(StorageError::Cancelled),
            continuation_token: None,
        };
        assert!(cancelled.is_cancelled());
    }
}
